//! Test generation: parameter expansion, filtering, worker hashing and
//! sharding.
//!
//! The generator turns declared specs into materialized test cases, groups
//! them into dispatchable jobs keyed by `(file, workerHash)`, and slices the
//! job list for the configured shard. The worker runner reuses
//! [`expand_file`] so both sides of the process boundary materialize
//! identical ids.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::case::{Annotation, TestCase, TestStatus};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fixture::FixtureRegistry;
use crate::loader::FileRegistry;
use crate::suite::{Modifier, Spec, Suite};

/// Named value lists the generator expands tests against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterMatrix {
    values: BTreeMap<String, Vec<Value>>,
}

impl ParameterMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, values: Vec<Value>) -> &mut Self {
        self.values.insert(name.into(), values);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[Value]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// Serializable per-test record sent to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEntry {
    pub test_id: String,
    pub retry: u32,
    pub timeout_ms: u64,
    pub expected_status: TestStatus,
    pub skipped: bool,
}

/// Atomic dispatcher work unit: one file, one worker hash, the entries to
/// run in file order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub file: String,
    pub worker_hash: String,
    /// Matrix cells shared by every entry; becomes the worker pool's
    /// parameter values.
    pub variation: BTreeMap<String, Value>,
    pub repeat_each_index: u32,
    pub entries: Vec<TestEntry>,
}

/// A generated test plus the entry-index path to its spec, for worker-side
/// body lookup.
#[derive(Debug, Clone)]
pub struct MaterializedTest {
    pub case: TestCase,
    pub spec_path: Vec<usize>,
}

/// Everything the dispatcher and reporters need for a run.
#[derive(Debug)]
pub struct RunPlan {
    pub suites: Vec<Arc<Suite>>,
    /// Canonical cases for this shard, in generation order.
    pub cases: IndexMap<String, TestCase>,
    pub jobs: Vec<JobPayload>,
    /// Test count before shard slicing.
    pub total_tests: usize,
}

struct Effective {
    skipped: bool,
    expected_status: TestStatus,
    timeout_ms: u64,
    annotations: Vec<Annotation>,
}

/// Fold modifiers outermost-suite first, spec last: inner declarations win
/// for scalar settings, `skip` accumulates.
fn effective_settings(config: &Config, chain: &[&Suite], spec: &Spec) -> Effective {
    let mut eff = Effective {
        skipped: false,
        expected_status: TestStatus::Passed,
        timeout_ms: config.timeout_ms,
        annotations: Vec::new(),
    };
    let mut apply = |modifiers: &[Modifier], annotations: &[Annotation], eff: &mut Effective| {
        for modifier in modifiers {
            match modifier {
                Modifier::Skip(reason) => {
                    eff.skipped = true;
                    eff.annotations
                        .push(Annotation::new("skip", reason.clone()));
                }
                Modifier::Fixme(reason) => {
                    eff.skipped = true;
                    eff.annotations
                        .push(Annotation::new("fixme", reason.clone()));
                }
                Modifier::Fail => eff.expected_status = TestStatus::Failed,
                Modifier::Slow => eff.timeout_ms = eff.timeout_ms.saturating_mul(3),
                Modifier::Timeout(ms) => eff.timeout_ms = *ms,
            }
        }
        eff.annotations.extend(annotations.iter().cloned());
    };
    for suite in chain {
        apply(&suite.modifiers, &suite.annotations, &mut eff);
    }
    apply(&spec.modifiers, &spec.annotations, &mut eff);
    eff
}

/// Worker compatibility hash: parameter tuple, repeat index and the reachable
/// worker-scoped fixture topology. Tests agreeing on all three may share a
/// worker and its worker-scoped instances.
fn worker_hash(parameters: &BTreeMap<String, Value>, repeat: u32, env: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (name, value) in parameters {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(value.to_string().as_bytes());
        hasher.update(&[0]);
    }
    hasher.update(&repeat.to_le_bytes());
    for name in env {
        hasher.update(&[1]);
        hasher.update(name.as_bytes());
    }
    hasher.finalize().to_hex()[..16].to_string()
}

fn cartesian(names: &[String], matrix: &ParameterMatrix) -> Vec<BTreeMap<String, Value>> {
    let mut tuples: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];
    for name in names {
        let Some(values) = matrix.get(name) else {
            continue;
        };
        let mut next = Vec::with_capacity(tuples.len() * values.len().max(1));
        for tuple in &tuples {
            for value in values {
                let mut t = tuple.clone();
                t.insert(name.clone(), value.clone());
                next.push(t);
            }
        }
        tuples = next;
    }
    tuples
}

/// Materialize every runnable test of one file suite. Deterministic for a
/// given config/matrix/fixture graph; the worker runner calls this with the
/// same inputs to rebuild ids locally.
pub fn expand_file(
    config: &Config,
    suite: &Suite,
    fixtures: &FixtureRegistry,
    matrix: &ParameterMatrix,
    focus_present: bool,
    grep: Option<&Regex>,
) -> Result<Vec<MaterializedTest>> {
    let autos: Vec<String> = fixtures
        .auto_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut collected: Vec<(Vec<&Suite>, Vec<usize>, &Spec)> = Vec::new();
    suite.visit_specs(&mut |chain, path, spec| {
        collected.push((chain.to_vec(), path.to_vec(), spec));
    });

    let mut tests = Vec::new();
    let mut ordinal = 0usize;
    for (chain, path, spec) in collected {
        let focused = spec.only || chain.iter().any(|s| s.only);
        if focus_present && !focused {
            continue;
        }
        let full_title: String = {
            let mut parts: Vec<&str> = chain
                .iter()
                .map(|s| s.title.as_str())
                .filter(|t| !t.is_empty())
                .collect();
            parts.push(&spec.title);
            parts.join(" ")
        };
        if let Some(grep) = grep {
            if !grep.is_match(&full_title) {
                continue;
            }
        }

        // Renumbered post-filtering so ids stay stable for a given filter.
        let spec_ordinal = ordinal;
        ordinal += 1;

        let roots = spec
            .fixtures
            .iter()
            .map(String::as_str)
            .chain(autos.iter().map(String::as_str));
        let closure = fixtures.transitive_closure(roots)?;

        let mut param_names: Vec<String> = Vec::new();
        let mut env_names: Vec<String> = Vec::new();
        for name in &closure {
            let reg = fixtures
                .get(name)
                .ok_or_else(|| Error::NoSuchFixture { name: name.clone() })?;
            if reg.is_parameter() {
                if matrix.contains(name) {
                    param_names.push(name.clone());
                }
            } else if reg.scope == crate::fixture::FixtureScope::Worker {
                env_names.push(name.clone());
            }
        }

        let eff = effective_settings(config, &chain, spec);
        let title_path: Vec<String> = {
            let mut parts: Vec<String> = chain
                .iter()
                .map(|s| s.title.clone())
                .filter(|t| !t.is_empty())
                .collect();
            parts.push(spec.title.clone());
            parts
        };

        for (variation, tuple) in cartesian(&param_names, matrix).into_iter().enumerate() {
            for repeat in 0..config.repeat_each {
                let hash = worker_hash(&tuple, repeat, &env_names);
                let id = TestCase::format_id(spec_ordinal, &spec.file, variation, repeat);
                tests.push(MaterializedTest {
                    case: TestCase {
                        id,
                        file: spec.file.clone(),
                        spec_ordinal,
                        title_path: title_path.clone(),
                        location: spec.location.clone(),
                        parameters: tuple.clone(),
                        variation,
                        repeat_each_index: repeat,
                        expected_status: eff.expected_status,
                        timeout_ms: eff.timeout_ms,
                        skipped: eff.skipped,
                        annotations: eff.annotations.clone(),
                        worker_hash: hash,
                        results: Vec::new(),
                    },
                    spec_path: path.clone(),
                });
            }
        }
    }
    Ok(tests)
}

fn focused_locations(suites: &[Suite]) -> Vec<String> {
    let mut locations = Vec::new();
    for suite in suites {
        suite.visit_specs(&mut |chain, _path, spec| {
            if spec.only {
                locations.push(spec.location.to_string());
            }
            for ancestor in chain {
                if ancestor.only {
                    let loc = ancestor.location.to_string();
                    if !locations.contains(&loc) {
                        locations.push(loc);
                    }
                }
            }
        });
    }
    locations
}

/// Load every registered file, expand, group into jobs and slice the shard.
pub fn generate(
    config: &Config,
    registry: &FileRegistry,
    fixtures: &FixtureRegistry,
    matrix: &ParameterMatrix,
) -> Result<RunPlan> {
    config.validate()?;
    let suites = registry.load_all()?;
    let grep = config.grep_regex()?;
    let focus_present = suites.iter().any(Suite::has_focus);
    if config.forbid_only && focus_present {
        return Err(Error::ForbidOnly(focused_locations(&suites).join(", ")));
    }

    let mut all_cases: IndexMap<String, TestCase> = IndexMap::new();
    // (hash, file_index, arrival) keyed job accumulation.
    let mut job_index: IndexMap<(String, String), (usize, usize, JobPayload)> = IndexMap::new();
    for (file_index, suite) in suites.iter().enumerate() {
        let tests = expand_file(config, suite, fixtures, matrix, focus_present, grep.as_ref())?;
        for test in tests {
            let case = test.case;
            let key = (case.file.clone(), case.worker_hash.clone());
            let arrival = job_index.len();
            let (_, _, job) = job_index.entry(key).or_insert_with(|| {
                (
                    file_index,
                    arrival,
                    JobPayload {
                        file: case.file.clone(),
                        worker_hash: case.worker_hash.clone(),
                        variation: case.parameters.clone(),
                        repeat_each_index: case.repeat_each_index,
                        entries: Vec::new(),
                    },
                )
            });
            job.entries.push(TestEntry {
                test_id: case.id.clone(),
                retry: 0,
                timeout_ms: case.timeout_ms,
                expected_status: case.expected_status,
                skipped: case.skipped,
            });
            all_cases.insert(case.id.clone(), case);
        }
    }

    // Lexicographic hash order; ties broken by file registration order, then
    // first-arrival order, so equal-hash jobs dispatch deterministically.
    let mut jobs: Vec<(String, usize, usize, JobPayload)> = job_index
        .into_iter()
        .map(|((_, hash), (file_index, arrival, job))| (hash, file_index, arrival, job))
        .collect();
    jobs.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    let jobs: Vec<JobPayload> = jobs.into_iter().map(|(_, _, _, job)| job).collect();

    let total_tests: usize = jobs.iter().map(|j| j.entries.len()).sum();

    // Jobs are the atomic shard unit: a job is taken iff its first test's
    // cumulative index lands in this shard's [from, to) window.
    let jobs = match config.shard {
        None => jobs,
        Some(shard) => {
            let size = total_tests.div_ceil(shard.total as usize);
            let from = size * shard.current as usize;
            let to = from + size;
            let mut start = 0usize;
            let mut kept = Vec::new();
            for job in jobs {
                let len = job.entries.len();
                if start >= from && start < to {
                    kept.push(job);
                }
                start += len;
            }
            kept
        }
    };

    let mut cases = IndexMap::new();
    for job in &jobs {
        for entry in &job.entries {
            if let Some(case) = all_cases.get(&entry.test_id) {
                cases.insert(entry.test_id.clone(), case.clone());
            }
        }
    }

    debug!(
        files = suites.len(),
        tests = cases.len(),
        jobs = jobs.len(),
        total = total_tests,
        "generated run plan"
    );

    Ok(RunPlan {
        suites: suites.into_iter().map(Arc::new).collect(),
        cases,
        jobs,
        total_tests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FixtureRegistration, FixtureScope, FixtureValue};

    fn plain_fixture(name: &str, scope: FixtureScope) -> FixtureRegistration {
        FixtureRegistration::setup(name, scope, |_ctx| {
            Ok((Arc::new(()) as FixtureValue, None))
        })
    }

    fn fixtures_with(regs: Vec<FixtureRegistration>) -> FixtureRegistry {
        let mut registry = FixtureRegistry::new();
        for reg in regs {
            registry.register(reg).unwrap();
        }
        registry.finalize().unwrap();
        registry
    }

    fn one_file_registry(count: usize) -> FileRegistry {
        let mut registry = FileRegistry::new();
        registry.test_file("tests/ten.rs", move |s| {
            for i in 0..count {
                s.test(&format!("case {i}"), |_ctx| Ok(()));
            }
        });
        registry
    }

    #[test]
    fn empty_matrix_yields_one_test_per_spec() {
        let registry = one_file_registry(3);
        let fixtures = fixtures_with(vec![]);
        let plan = generate(
            &Config::default(),
            &registry,
            &fixtures,
            &ParameterMatrix::new(),
        )
        .unwrap();
        assert_eq!(plan.cases.len(), 3);
        // Same file, no parameters: a single job.
        assert_eq!(plan.jobs.len(), 1);
        assert_eq!(plan.jobs[0].entries.len(), 3);
    }

    #[test]
    fn matrix_expansion_multiplies_with_repeat_each() {
        let mut registry = FileRegistry::new();
        registry.test_file("tests/matrix.rs", |s| {
            s.test("expanded", |_ctx| Ok(())).fixtures(["mode"]);
        });
        let fixtures = fixtures_with(vec![FixtureRegistration::parameter("mode")]);
        let mut matrix = ParameterMatrix::new();
        matrix.set("mode", vec![serde_json::json!("a"), serde_json::json!("b")]);
        let config = Config {
            repeat_each: 3,
            ..Config::default()
        };

        let plan = generate(&config, &registry, &fixtures, &matrix).unwrap();
        assert_eq!(plan.cases.len(), 6);
        // Two variations x three repeats, every combination its own worker
        // hash, hence its own job.
        assert_eq!(plan.jobs.len(), 6);
        let ids: Vec<&String> = plan.cases.keys().collect();
        assert!(ids.contains(&&"0@tests/matrix.rs#run0-repeat0".to_string()));
        assert!(ids.contains(&&"0@tests/matrix.rs#run1-repeat2".to_string()));
    }

    #[test]
    fn ids_are_stable_across_generations() {
        let registry = one_file_registry(4);
        let fixtures = fixtures_with(vec![]);
        let config = Config::default();
        let matrix = ParameterMatrix::new();

        let first = generate(&config, &registry, &fixtures, &matrix).unwrap();
        let second = generate(&config, &registry, &fixtures, &matrix).unwrap();
        let a: Vec<&String> = first.cases.keys().collect();
        let b: Vec<&String> = second.cases.keys().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn grep_filters_and_renumbers() {
        let mut registry = FileRegistry::new();
        registry.test_file("tests/grep.rs", |s| {
            s.test("alpha smoke", |_ctx| Ok(()));
            s.test("beta", |_ctx| Ok(()));
            s.test("gamma smoke", |_ctx| Ok(()));
        });
        let fixtures = fixtures_with(vec![]);
        let config = Config {
            grep: Some("smoke".to_string()),
            ..Config::default()
        };
        let plan = generate(&config, &registry, &fixtures, &ParameterMatrix::new()).unwrap();
        let ids: Vec<&String> = plan.cases.keys().collect();
        // Ordinals count filtered specs, not declared ones.
        assert_eq!(
            ids,
            vec!["0@tests/grep.rs#run0-repeat0", "1@tests/grep.rs#run0-repeat0"]
        );
    }

    #[test]
    fn focus_restricts_to_focused_subtree() {
        let mut registry = FileRegistry::new();
        registry.test_file("tests/focus.rs", |s| {
            s.test("plain", |_ctx| Ok(()));
            s.describe_only("group", |s| {
                s.test("inside a", |_ctx| Ok(()));
                s.test("inside b", |_ctx| Ok(()));
            });
        });
        let fixtures = fixtures_with(vec![]);
        let plan = generate(
            &Config::default(),
            &registry,
            &fixtures,
            &ParameterMatrix::new(),
        )
        .unwrap();
        let titles: Vec<String> = plan.cases.values().map(|c| c.full_title()).collect();
        assert_eq!(titles, vec!["group inside a", "group inside b"]);
    }

    #[test]
    fn focus_filter_is_idempotent() {
        let mut registry = FileRegistry::new();
        registry.test_file("tests/focus.rs", |s| {
            s.test("plain", |_ctx| Ok(()));
            s.test("chosen", |_ctx| Ok(())).only();
        });
        let fixtures = fixtures_with(vec![]);
        let config = Config::default();
        let matrix = ParameterMatrix::new();
        let once = generate(&config, &registry, &fixtures, &matrix).unwrap();
        let twice = generate(&config, &registry, &fixtures, &matrix).unwrap();
        let a: Vec<&String> = once.cases.keys().collect();
        let b: Vec<&String> = twice.cases.keys().collect();
        assert_eq!(a, b);
        assert_eq!(once.cases.len(), 1);
    }

    #[test]
    fn forbid_only_fails_generation() {
        let mut registry = FileRegistry::new();
        registry.test_file("tests/focus.rs", |s| {
            s.test("chosen", |_ctx| Ok(())).only();
        });
        let fixtures = fixtures_with(vec![]);
        let config = Config {
            forbid_only: true,
            ..Config::default()
        };
        let err = generate(&config, &registry, &fixtures, &ParameterMatrix::new()).unwrap_err();
        assert!(matches!(err, Error::ForbidOnly(_)));
    }

    #[test]
    fn skip_modifier_marks_tests_without_removing_them() {
        let mut registry = FileRegistry::new();
        registry.test_file("tests/skip.rs", |s| {
            s.describe("flaky area", |s| {
                s.skip_all("quarantined");
                s.test("unstable", |_ctx| Ok(()));
            });
            s.test("stable", |_ctx| Ok(()));
        });
        let fixtures = fixtures_with(vec![]);
        let plan = generate(
            &Config::default(),
            &registry,
            &fixtures,
            &ParameterMatrix::new(),
        )
        .unwrap();
        assert_eq!(plan.cases.len(), 2);
        let unstable = plan
            .cases
            .values()
            .find(|c| c.title() == "unstable")
            .unwrap();
        assert!(unstable.skipped);
        assert!(unstable.annotations.iter().any(|a| a.kind == "skip"));
        let stable = plan.cases.values().find(|c| c.title() == "stable").unwrap();
        assert!(!stable.skipped);
    }

    #[test]
    fn timeout_and_fail_modifiers_apply_innermost_last() {
        let mut registry = FileRegistry::new();
        registry.test_file("tests/mods.rs", |s| {
            s.describe("outer", |s| {
                s.set_timeout(10_000);
                s.test("inner wins", |_ctx| Ok(())).timeout(2_000).fails();
            });
        });
        let fixtures = fixtures_with(vec![]);
        let plan = generate(
            &Config::default(),
            &registry,
            &fixtures,
            &ParameterMatrix::new(),
        )
        .unwrap();
        let case = plan.cases.values().next().unwrap();
        assert_eq!(case.timeout_ms, 2_000);
        assert_eq!(case.expected_status, TestStatus::Failed);
    }

    #[test]
    fn same_worker_fixtures_share_hash_across_specs() {
        let mut registry = FileRegistry::new();
        registry.test_file("tests/affinity.rs", |s| {
            s.test("first", |_ctx| Ok(())).fixtures(["server", "scratch_a"]);
            s.test("second", |_ctx| Ok(())).fixtures(["server", "scratch_b"]);
            s.test("other env", |_ctx| Ok(())).fixtures(["cache"]);
        });
        let fixtures = fixtures_with(vec![
            plain_fixture("server", FixtureScope::Worker),
            plain_fixture("cache", FixtureScope::Worker),
            plain_fixture("scratch_a", FixtureScope::Test),
            plain_fixture("scratch_b", FixtureScope::Test),
        ]);
        let plan = generate(
            &Config::default(),
            &registry,
            &fixtures,
            &ParameterMatrix::new(),
        )
        .unwrap();

        let hash_of = |title: &str| {
            plan.cases
                .values()
                .find(|c| c.title() == title)
                .unwrap()
                .worker_hash
                .clone()
        };
        assert_eq!(hash_of("first"), hash_of("second"));
        assert_ne!(hash_of("first"), hash_of("other env"));
    }

    #[test]
    fn shard_slices_whole_jobs() {
        // Ten files with one test each: ten single-test jobs sharing a hash,
        // kept in registration order.
        let mut registry = FileRegistry::new();
        for i in 0..10 {
            registry.test_file(format!("tests/file{i:02}.rs"), |s| {
                s.test("case", |_ctx| Ok(()));
            });
        }
        let fixtures = fixtures_with(vec![]);
        let config = Config {
            shard: Some(crate::config::Shard {
                current: 2,
                total: 5,
            }),
            ..Config::default()
        };
        let plan = generate(&config, &registry, &fixtures, &ParameterMatrix::new()).unwrap();
        assert_eq!(plan.total_tests, 10);
        let files: Vec<&str> = plan.jobs.iter().map(|j| j.file.as_str()).collect();
        assert_eq!(files, vec!["tests/file04.rs", "tests/file05.rs"]);
    }

    #[test]
    fn shards_partition_all_tests() {
        let fixtures = fixtures_with(vec![]);
        let mut registry = FileRegistry::new();
        for i in 0..7 {
            registry.test_file(format!("tests/file{i}.rs"), |s| {
                s.test("case", |_ctx| Ok(()));
            });
        }
        let matrix = ParameterMatrix::new();
        let mut seen = Vec::new();
        for current in 0..3 {
            let config = Config {
                shard: Some(crate::config::Shard { current, total: 3 }),
                ..Config::default()
            };
            let plan = generate(&config, &registry, &fixtures, &matrix).unwrap();
            for id in plan.cases.keys() {
                assert!(!seen.contains(id), "test {id} appeared in two shards");
                seen.push(id.clone());
            }
        }
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn job_payload_serialization_is_byte_stable() {
        let registry = one_file_registry(2);
        let fixtures = fixtures_with(vec![]);
        let plan = generate(
            &Config::default(),
            &registry,
            &fixtures,
            &ParameterMatrix::new(),
        )
        .unwrap();
        let job = &plan.jobs[0];
        let first = serde_json::to_string(job).unwrap();
        let decoded: JobPayload = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&decoded).unwrap();
        assert_eq!(first, second);
        assert_eq!(&decoded, job);
    }

    #[test]
    fn expand_file_matches_generate_ids() {
        let mut registry = FileRegistry::new();
        registry.test_file("tests/stable.rs", |s| {
            s.test("one", |_ctx| Ok(()));
            s.test("two", |_ctx| Ok(()));
        });
        let fixtures = fixtures_with(vec![]);
        let config = Config::default();
        let matrix = ParameterMatrix::new();

        let plan = generate(&config, &registry, &fixtures, &matrix).unwrap();
        let suite = registry.load_file("tests/stable.rs").unwrap();
        let local = expand_file(&config, &suite, &fixtures, &matrix, false, None).unwrap();
        let local_ids: Vec<String> = local.iter().map(|t| t.case.id.clone()).collect();
        let plan_ids: Vec<&String> = plan.cases.keys().collect();
        assert_eq!(local_ids.iter().collect::<Vec<_>>(), plan_ids);
    }
}
