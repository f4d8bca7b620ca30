//! Bundle loading and validation.
//!
//! `task.yaml` is parsed into an untyped YAML tree first and then walked
//! field by field, so that every problem in the file is reported in one
//! pass instead of stopping at the first one. Unknown keys are kept as
//! opaque pass-through data.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::{
    BuildSource, CheckSpec, EnvironmentSpec, Extra, ReadinessSpec, ResourceLimits, SolutionSpec,
    TaskBundle, TaskMetadata, Timeouts, VerifierMode, VerifierSpec,
};
use crate::config::PlatformLimits;
use crate::error::{BundleError, Violation};
use crate::execution::PORT_VAR;
use crate::readiness::{ProbeTarget, ReadinessCheck, TargetPort, DEFAULT_POLL_INTERVAL};
use crate::reward::RewardMode;

/// Name of the descriptor file inside a bundle directory.
pub const BUNDLE_FILE: &str = "task.yaml";

const NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$";
const DEFAULT_CONTEXT: &str = "environment";
const DEFAULT_WORKDIR: &str = "/app";
const DEFAULT_SOLUTION_DIR: &str = "solution";
const DEFAULT_SOLUTION_ENTRYPOINT: &str = "solve.sh";
const DEFAULT_VERIFIER_DIR: &str = "tests";
const DEFAULT_VERIFIER_ENTRYPOINT: &str = "test.sh";
const DEFAULT_RESULTS_FILE: &str = "/logs/verifier/results.jsonl";

const TOP_LEVEL_KEYS: &[&str] = &[
    "name",
    "version",
    "metadata",
    "resources",
    "timeouts",
    "environment",
    "readiness",
    "solution",
    "verifier",
];

/// Loads and validates the bundle at `path` (a bundle directory or its
/// `task.yaml`).
///
/// # Errors
///
/// - `BundleError::NotFound` if there is no descriptor at `path`.
/// - `BundleError::Invalid` listing every violation found.
pub fn load_bundle(path: &Path, limits: &PlatformLimits) -> Result<TaskBundle, BundleError> {
    let (root, file) = if path.is_dir() {
        (path.to_path_buf(), path.join(BUNDLE_FILE))
    } else if path.is_file() {
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        (root, path.to_path_buf())
    } else {
        return Err(BundleError::NotFound(path.to_path_buf()));
    };

    if !file.is_file() {
        return Err(BundleError::NotFound(file));
    }

    let root = fs::canonicalize(&root)?;
    let yaml = fs::read_to_string(&file)?;
    parse_bundle(&yaml, &root, limits)
}

/// Returns every immediate sub-directory of `dir` that holds a descriptor,
/// sorted by path.
pub fn discover_bundles(dir: &Path) -> Result<Vec<PathBuf>, BundleError> {
    if !dir.is_dir() {
        return Err(BundleError::NotFound(dir.to_path_buf()));
    }
    let mut bundles = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && path.join(BUNDLE_FILE).is_file() {
            bundles.push(path);
        }
    }
    bundles.sort();
    Ok(bundles)
}

/// Validates a descriptor whose relative paths resolve against `root`.
pub fn parse_bundle(
    yaml: &str,
    root: &Path,
    limits: &PlatformLimits,
) -> Result<TaskBundle, BundleError> {
    let fallback_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<unnamed>".to_string());

    let doc: Value = match serde_yaml::from_str(yaml) {
        Ok(doc) => doc,
        Err(e) => {
            return Err(BundleError::Invalid {
                bundle: fallback_name,
                violations: vec![Violation::new(BUNDLE_FILE, format!("malformed YAML: {e}"))],
            })
        }
    };
    let Value::Mapping(doc) = doc else {
        return Err(BundleError::Invalid {
            bundle: fallback_name,
            violations: vec![Violation::new(BUNDLE_FILE, "top level must be a mapping")],
        });
    };

    let mut v = Validator::new(limits);
    let name = v.name(&doc);
    let version = v.scalar_string(&doc, "version", "");
    let metadata = v.metadata(&doc);
    let resources = v.resources(&doc);
    let timeouts = v.timeouts(&doc);
    let environment = v.environment(&doc, root);
    let readiness = v.readiness(&doc);
    let solution = v.solution(&doc, root);
    let verifier = v.verifier(&doc, root);

    let digest = match (&environment, doc.get("environment")) {
        (Some(env), Some(section)) => match build_digest(section, &env.context) {
            Ok(digest) => digest,
            Err(e) => {
                v.add("environment.context", format!("cannot read build context: {e}"));
                String::new()
            }
        },
        _ => String::new(),
    };

    let bundle_name = name.clone().unwrap_or(fallback_name);
    match (
        v.violations.is_empty(),
        name,
        resources,
        timeouts,
        environment,
        verifier,
    ) {
        (true, Some(name), Some(resources), Some(timeouts), Some(environment), Some(verifier)) => {
            Ok(TaskBundle {
                name,
                version,
                root: root.to_path_buf(),
                metadata,
                resources,
                timeouts,
                environment,
                readiness,
                solution,
                verifier,
                digest,
                extra: extras(&doc, TOP_LEVEL_KEYS),
            })
        }
        _ => Err(BundleError::Invalid {
            bundle: bundle_name,
            violations: v.violations,
        }),
    }
}

/// SHA-256 over the environment section and every file of the build
/// context, walked in sorted order.
fn build_digest(section: &Value, context: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let rendered = serde_yaml::to_string(section).map_err(std::io::Error::other)?;
    hasher.update(rendered.as_bytes());

    if context.is_dir() {
        for entry in WalkDir::new(context).sort_by_file_name().follow_links(false) {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(context)
                .map_err(std::io::Error::other)?;
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(fs::read(entry.path())?);
            hasher.update([0u8]);
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

fn extras(map: &Mapping, known: &[&str]) -> Extra {
    map.iter()
        .filter_map(|(k, v)| {
            let key = k.as_str()?;
            (!known.contains(&key)).then(|| (key.to_string(), v.clone()))
        })
        .collect()
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Collects violations while extracting typed values.
struct Validator<'a> {
    limits: &'a PlatformLimits,
    violations: Vec<Violation>,
}

impl<'a> Validator<'a> {
    fn new(limits: &'a PlatformLimits) -> Self {
        Self {
            limits,
            violations: Vec::new(),
        }
    }

    fn add(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.violations.push(Violation::new(field, reason));
    }

    fn mapping<'v>(
        &mut self,
        parent: &'v Mapping,
        key: &str,
        path: &str,
        required: bool,
    ) -> Option<&'v Mapping> {
        let field = join(path, key);
        match parent.get(key) {
            None | Some(Value::Null) => {
                if required {
                    self.add(field, "missing required section");
                }
                None
            }
            Some(Value::Mapping(m)) => Some(m),
            Some(other) => {
                self.add(field, format!("expected a mapping, found {}", describe(other)));
                None
            }
        }
    }

    fn string(&mut self, map: &Mapping, key: &str, path: &str, required: bool) -> Option<String> {
        let field = join(path, key);
        match map.get(key) {
            None | Some(Value::Null) => {
                if required {
                    self.add(field, "missing required field");
                }
                None
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                self.add(field, "must not be empty");
                None
            }
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                self.add(field, format!("expected a string, found {}", describe(other)));
                None
            }
        }
    }

    /// Accepts strings, numbers and booleans, rendered as text.
    fn scalar_string(&mut self, map: &Mapping, key: &str, path: &str) -> Option<String> {
        match map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            Some(other) => {
                self.add(
                    join(path, key),
                    format!("expected a scalar, found {}", describe(other)),
                );
                None
            }
        }
    }

    /// A required positive integer no larger than `max`.
    fn positive_int(&mut self, map: &Mapping, key: &str, path: &str, max: u64) -> Option<u64> {
        let field = join(path, key);
        match map.get(key) {
            None | Some(Value::Null) => {
                self.add(field, "missing required field");
                None
            }
            Some(Value::Number(n)) => match n.as_u64() {
                Some(0) => {
                    self.add(field, "must be greater than 0");
                    None
                }
                Some(value) if value > max => {
                    self.add(field, format!("{value} exceeds the platform limit of {max}"));
                    None
                }
                Some(value) => Some(value),
                None => {
                    self.add(field, format!("must be a positive integer, found {n}"));
                    None
                }
            },
            Some(other) => {
                self.add(field, format!("expected an integer, found {}", describe(other)));
                None
            }
        }
    }

    fn optional_int(&mut self, map: &Mapping, key: &str, path: &str) -> Option<u64> {
        match map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) if n.as_u64().is_some() => n.as_u64(),
            Some(other) => {
                self.add(
                    join(path, key),
                    format!("expected a non-negative integer, found {}", describe(other)),
                );
                None
            }
        }
    }

    fn optional_float(&mut self, map: &Mapping, key: &str, path: &str) -> Option<f64> {
        match map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_f64(),
            Some(other) => {
                self.add(
                    join(path, key),
                    format!("expected a number, found {}", describe(other)),
                );
                None
            }
        }
    }

    fn name(&mut self, doc: &Mapping) -> Option<String> {
        let name = self.string(doc, "name", "", true)?;
        let valid = Regex::new(NAME_PATTERN)
            .map(|re| re.is_match(&name))
            .unwrap_or(false);
        if !valid {
            self.add(
                "name",
                "must start with a letter or digit and contain only letters, digits, '.', '_' or '-' (max 128)",
            );
            return None;
        }
        Some(name)
    }

    fn metadata(&mut self, doc: &Mapping) -> TaskMetadata {
        let Some(map) = self.mapping(doc, "metadata", "", false) else {
            return TaskMetadata::default();
        };
        let category = self.scalar_string(map, "category", "metadata");
        let difficulty = self.scalar_string(map, "difficulty", "metadata");
        let tags = match map.get("tags") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Sequence(items)) => items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    other => {
                        self.add(
                            format!("metadata.tags[{i}]"),
                            format!("expected a string, found {}", describe(other)),
                        );
                        None
                    }
                })
                .collect(),
            Some(other) => {
                self.add(
                    "metadata.tags",
                    format!("expected a list, found {}", describe(other)),
                );
                Vec::new()
            }
        };
        TaskMetadata {
            category,
            difficulty,
            tags,
            extra: extras(map, &["category", "difficulty", "tags"]),
        }
    }

    fn resources(&mut self, doc: &Mapping) -> Option<ResourceLimits> {
        let map = self.mapping(doc, "resources", "", true)?;
        let cpus = match map.get("cpus") {
            None | Some(Value::Null) => {
                self.add("resources.cpus", "missing required field");
                None
            }
            Some(Value::Number(n)) => match n.as_f64() {
                Some(c) if !c.is_finite() || c <= 0.0 => {
                    self.add("resources.cpus", "must be greater than 0");
                    None
                }
                Some(c) if c > self.limits.max_cpus => {
                    self.add(
                        "resources.cpus",
                        format!("{c} exceeds the platform limit of {}", self.limits.max_cpus),
                    );
                    None
                }
                other => other,
            },
            Some(other) => {
                self.add(
                    "resources.cpus",
                    format!("expected a number, found {}", describe(other)),
                );
                None
            }
        };
        let memory_mb = self.positive_int(map, "memory_mb", "resources", self.limits.max_memory_mb);
        let storage_mb =
            self.positive_int(map, "storage_mb", "resources", self.limits.max_storage_mb);

        Some(ResourceLimits {
            cpus: cpus?,
            memory_mb: memory_mb?,
            storage_mb: storage_mb?,
            extra: extras(map, &["cpus", "memory_mb", "storage_mb"]),
        })
    }

    fn timeouts(&mut self, doc: &Mapping) -> Option<Timeouts> {
        let map = self.mapping(doc, "timeouts", "", true)?;
        let max = self.limits.max_timeout_secs;
        let build = self.positive_int(map, "build_sec", "timeouts", max);
        let agent = self.positive_int(map, "agent_sec", "timeouts", max);
        let verifier = self.positive_int(map, "verifier_sec", "timeouts", max);

        Some(Timeouts {
            build: Duration::from_secs(build?),
            agent: Duration::from_secs(agent?),
            verifier: Duration::from_secs(verifier?),
            extra: extras(map, &["build_sec", "agent_sec", "verifier_sec"]),
        })
    }

    fn environment(&mut self, doc: &Mapping, root: &Path) -> Option<EnvironmentSpec> {
        let map = self.mapping(doc, "environment", "", true)?;
        let dockerfile = self.string(map, "dockerfile", "environment", false);
        let image = self.string(map, "image", "environment", false);
        let command = self.string(map, "build_command", "environment", false);
        let context_rel = self
            .string(map, "context", "environment", false)
            .unwrap_or_else(|| DEFAULT_CONTEXT.to_string());
        let workdir = self
            .string(map, "workdir", "environment", false)
            .unwrap_or_else(|| DEFAULT_WORKDIR.to_string());
        let start = self.string(map, "start", "environment", false);
        let network = self.string(map, "network", "environment", false);

        if !workdir.starts_with('/') {
            self.add("environment.workdir", "must be an absolute path");
        }

        let context = root.join(&context_rel);
        let source = match (dockerfile, image, command) {
            (Some(dockerfile), None, None) => {
                if !context.is_dir() {
                    self.add(
                        "environment.context",
                        format!("build context '{context_rel}' is not a directory"),
                    );
                } else if !context.join(&dockerfile).is_file() {
                    self.add(
                        "environment.dockerfile",
                        format!("'{dockerfile}' not found in '{context_rel}'"),
                    );
                }
                BuildSource::Dockerfile(PathBuf::from(dockerfile))
            }
            (None, Some(image), None) => BuildSource::Image(image),
            (None, None, Some(command)) => BuildSource::Command(command),
            (None, None, None) => {
                self.add(
                    "environment",
                    "must declare one of 'dockerfile', 'image' or 'build_command'",
                );
                return None;
            }
            _ => {
                self.add(
                    "environment",
                    "'dockerfile', 'image' and 'build_command' are mutually exclusive",
                );
                return None;
            }
        };

        Some(EnvironmentSpec {
            source,
            context,
            workdir,
            start,
            network,
            extra: extras(
                map,
                &[
                    "dockerfile",
                    "image",
                    "build_command",
                    "context",
                    "workdir",
                    "start",
                    "network",
                ],
            ),
        })
    }

    fn readiness(&mut self, doc: &Mapping) -> ReadinessSpec {
        let Some(map) = self.mapping(doc, "readiness", "", false) else {
            return ReadinessSpec::default();
        };

        let items: &[Value] = match map.get("checks") {
            None | Some(Value::Null) => &[],
            Some(Value::Sequence(items)) => items,
            Some(other) => {
                self.add(
                    "readiness.checks",
                    format!("expected a list, found {}", describe(other)),
                );
                &[]
            }
        };

        let deadline = if items.is_empty() {
            self.optional_int(map, "deadline_sec", "readiness")
                .map(Duration::from_secs)
                .unwrap_or_else(|| ReadinessSpec::default().deadline)
        } else {
            Duration::from_secs(
                self.positive_int(map, "deadline_sec", "readiness", self.limits.max_timeout_secs)
                    .unwrap_or(0),
            )
        };

        let mut checks: Vec<ReadinessCheck> = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let path = format!("readiness.checks[{i}]");
            let Value::Mapping(check) = item else {
                self.add(path, format!("expected a mapping, found {}", describe(item)));
                continue;
            };
            if let Some(parsed) = self.readiness_check(check, &path) {
                if checks.iter().any(|c| c.name == parsed.name) {
                    self.add(
                        format!("{path}.name"),
                        format!("duplicate readiness check '{}'", parsed.name),
                    );
                    continue;
                }
                checks.push(parsed);
            }
        }

        ReadinessSpec {
            deadline,
            checks,
            extra: extras(map, &["deadline_sec", "checks"]),
        }
    }

    fn readiness_check(&mut self, check: &Mapping, path: &str) -> Option<ReadinessCheck> {
        let name = self.string(check, "name", path, true);
        let interval = match self.optional_int(check, "interval_ms", path) {
            Some(0) => {
                self.add(join(path, "interval_ms"), "must be greater than 0");
                DEFAULT_POLL_INTERVAL
            }
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_POLL_INTERVAL,
        };

        let declared: Vec<&str> = ["http", "tcp", "command"]
            .into_iter()
            .filter(|k| check.get(*k).is_some())
            .collect();
        if declared.len() != 1 {
            self.add(
                path,
                "must declare exactly one of 'http', 'tcp' or 'command'",
            );
            return None;
        }

        let target = match declared[0] {
            "http" => {
                let http_path = join(path, "http");
                let map = self.mapping(check, "http", path, true)?;
                let url = self.string(map, "url", &http_path, true)?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    self.add(join(&http_path, "url"), "must be an http:// or https:// URL");
                    return None;
                }
                let status = match self.optional_int(map, "status", &http_path) {
                    None => 200,
                    Some(code @ 100..=599) => code as u16,
                    Some(code) => {
                        self.add(
                            join(&http_path, "status"),
                            format!("{code} is not an HTTP status code"),
                        );
                        return None;
                    }
                };
                ProbeTarget::Http { url, status }
            }
            "tcp" => {
                let tcp_path = join(path, "tcp");
                let map = self.mapping(check, "tcp", path, true)?;
                let host = self.string(map, "host", &tcp_path, true);
                let port = self.target_port(map, &tcp_path);
                ProbeTarget::Tcp {
                    host: host?,
                    port: port?,
                }
            }
            _ => ProbeTarget::Command(self.string(check, "command", path, true)?),
        };

        let mut parsed = ReadinessCheck::new(name?, target).with_interval(interval);
        parsed.extra = extras(check, &["name", "interval_ms", "http", "tcp", "command"]);
        Some(parsed)
    }

    /// A TCP port: an integer, or the context's service port variable.
    fn target_port(&mut self, map: &Mapping, path: &str) -> Option<TargetPort> {
        let field = join(path, "port");
        match map.get("port") {
            None | Some(Value::Null) => {
                self.add(field, "missing required field");
                None
            }
            Some(Value::Number(n)) => match n.as_u64() {
                Some(port @ 1..=65535) => Some(TargetPort::Fixed(port as u16)),
                _ => {
                    self.add(field, format!("{n} is not a valid port"));
                    None
                }
            },
            Some(Value::String(s))
                if s.trim() == format!("${PORT_VAR}") || s.trim() == format!("${{{PORT_VAR}}}") =>
            {
                Some(TargetPort::Service)
            }
            Some(Value::String(s)) => match s.trim().parse::<u16>() {
                Ok(port) if port > 0 => Some(TargetPort::Fixed(port)),
                _ => {
                    self.add(
                        field,
                        format!("'{s}' is neither a port number nor ${PORT_VAR}"),
                    );
                    None
                }
            },
            Some(other) => {
                self.add(field, format!("expected an integer, found {}", describe(other)));
                None
            }
        }
    }

    fn solution(&mut self, doc: &Mapping, root: &Path) -> Option<SolutionSpec> {
        let declared = self.mapping(doc, "solution", "", false);
        let dir_rel = declared
            .and_then(|m| self.string(m, "path", "solution", false))
            .unwrap_or_else(|| DEFAULT_SOLUTION_DIR.to_string());
        let entrypoint = declared
            .and_then(|m| self.string(m, "entrypoint", "solution", false))
            .unwrap_or_else(|| DEFAULT_SOLUTION_ENTRYPOINT.to_string());
        let dir = root.join(&dir_rel);

        if !dir.is_dir() {
            if declared.is_some() {
                self.add("solution.path", format!("'{dir_rel}' is not a directory"));
            }
            return None;
        }
        if !dir.join(&entrypoint).is_file() {
            if declared.is_some() {
                self.add(
                    "solution.entrypoint",
                    format!("'{entrypoint}' not found in '{dir_rel}'"),
                );
            }
            return None;
        }
        Some(SolutionSpec {
            dir,
            entrypoint,
            extra: declared
                .map(|m| extras(m, &["path", "entrypoint"]))
                .unwrap_or_default(),
        })
    }

    fn verifier(&mut self, doc: &Mapping, root: &Path) -> Option<VerifierSpec> {
        let map = self.mapping(doc, "verifier", "", true)?;
        let dir_rel = self
            .string(map, "path", "verifier", false)
            .unwrap_or_else(|| DEFAULT_VERIFIER_DIR.to_string());
        let entrypoint = self.string(map, "entrypoint", "verifier", false);
        let results_file = self
            .string(map, "results_file", "verifier", false)
            .unwrap_or_else(|| DEFAULT_RESULTS_FILE.to_string());
        if !results_file.starts_with('/') {
            self.add("verifier.results_file", "must be an absolute path");
        }

        let reward_mode = match map.get("reward_mode") {
            None | Some(Value::Null) => Some(RewardMode::default()),
            Some(Value::String(s)) => match s.parse::<RewardMode>() {
                Ok(mode) => Some(mode),
                Err(e) => {
                    self.add("verifier.reward_mode", e);
                    None
                }
            },
            Some(other) => {
                self.add(
                    "verifier.reward_mode",
                    format!("expected 'binary' or 'partial', found {}", describe(other)),
                );
                None
            }
        };

        let checks = self.verifier_checks(map);
        let weighted = checks.iter().any(|c| (c.weight - 1.0).abs() > f64::EPSILON);
        if weighted && reward_mode == Some(RewardMode::Binary) {
            self.add("verifier.reward_mode", "weights require reward_mode: partial");
        }
        let reward_mode = reward_mode.unwrap_or_default();
        let dir = root.join(&dir_rel);
        let with_commands = checks.iter().filter(|c| c.command.is_some()).count();

        let mode = match entrypoint {
            Some(entrypoint) => {
                if with_commands > 0 {
                    self.add(
                        "verifier.checks",
                        "check commands cannot be combined with verifier.entrypoint",
                    );
                }
                VerifierMode::Script { entrypoint }
            }
            None if !checks.is_empty() && with_commands == checks.len() => VerifierMode::Commands,
            None if with_commands > 0 => {
                self.add(
                    "verifier.checks",
                    "every check needs a command when no entrypoint is declared",
                );
                return None;
            }
            None if dir.join(DEFAULT_VERIFIER_ENTRYPOINT).is_file() => VerifierMode::Script {
                entrypoint: DEFAULT_VERIFIER_ENTRYPOINT.to_string(),
            },
            None => {
                self.add(
                    "verifier",
                    format!(
                        "declares neither an entrypoint nor check commands, and '{dir_rel}/{DEFAULT_VERIFIER_ENTRYPOINT}' does not exist"
                    ),
                );
                return None;
            }
        };

        let dir = match &mode {
            VerifierMode::Script { entrypoint } => {
                if !dir.is_dir() {
                    self.add("verifier.path", format!("'{dir_rel}' is not a directory"));
                } else if !dir.join(entrypoint).is_file() {
                    self.add(
                        "verifier.entrypoint",
                        format!("'{entrypoint}' not found in '{dir_rel}'"),
                    );
                }
                Some(dir)
            }
            VerifierMode::Commands => dir.is_dir().then_some(dir),
        };

        Some(VerifierSpec {
            dir,
            mode,
            results_file,
            reward_mode,
            checks,
            extra: extras(
                map,
                &[
                    "path",
                    "entrypoint",
                    "results_file",
                    "reward_mode",
                    "checks",
                ],
            ),
        })
    }

    fn verifier_checks(&mut self, map: &Mapping) -> Vec<CheckSpec> {
        let items = match map.get("checks") {
            None | Some(Value::Null) => return Vec::new(),
            Some(Value::Sequence(items)) => items,
            Some(other) => {
                self.add(
                    "verifier.checks",
                    format!("expected a list, found {}", describe(other)),
                );
                return Vec::new();
            }
        };

        let mut checks: Vec<CheckSpec> = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let path = format!("verifier.checks[{i}]");
            let Value::Mapping(check) = item else {
                self.add(path, format!("expected a mapping, found {}", describe(item)));
                continue;
            };
            let id = self.scalar_string(check, "id", &path);
            let weight = self.optional_float(check, "weight", &path).unwrap_or(1.0);
            let command = self.string(check, "command", &path, false);

            if !weight.is_finite() || weight < 0.0 {
                self.add(join(&path, "weight"), "must be a finite number >= 0");
                continue;
            }
            let Some(id) = id.filter(|id| !id.trim().is_empty()) else {
                self.add(join(&path, "id"), "missing required field");
                continue;
            };
            if checks.iter().any(|c| c.id == id) {
                self.add(join(&path, "id"), format!("duplicate check id '{id}'"));
                continue;
            }
            checks.push(CheckSpec {
                id,
                weight,
                command,
                extra: extras(check, &["id", "weight", "command"]),
            });
        }
        checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    #[test]
    fn test_discover_bundles_skips_plain_directories() {
        let dir = fixture(&[
            ("b-task/task.yaml", "name: b"),
            ("a-task/task.yaml", "name: a"),
            ("notes/readme.txt", "not a bundle"),
        ]);
        let found = discover_bundles(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a-task", "b-task"]);
        assert!(matches!(
            discover_bundles(&dir.path().join("missing")),
            Err(BundleError::NotFound(_))
        ));
    }

    const VALID: &str = r#"
name: fix-health-endpoint
version: "1.0"
metadata:
  category: debugging
  difficulty: medium
  tags: [http, python]
  author_notes: keep me
resources:
  cpus: 2
  memory_mb: 4096
  storage_mb: 10240
  gpu: none
timeouts:
  build_sec: 600
  agent_sec: 900
  verifier_sec: 300
  grace_sec: 10
environment:
  dockerfile: Dockerfile
readiness:
  deadline_sec: 30
  checks:
    - name: health
      http: { url: "http://127.0.0.1:8080/health" }
      owner: api
  warmup: true
solution:
  entrypoint: solve.sh
  author: maintainers
verifier:
  entrypoint: test.sh
  reward_mode: partial
  runner: pytest
  checks:
    - id: test_create
      description: creates a record
    - id: test_delete
      weight: 2
benchmark: terminal-bench
"#;

    fn valid_fixture() -> TempDir {
        fixture(&[
            ("environment/Dockerfile", "FROM python:3.12-slim\n"),
            ("solution/solve.sh", "#!/bin/bash\n"),
            ("tests/test.sh", "#!/bin/bash\n"),
        ])
    }

    #[test]
    fn test_parse_valid_bundle() {
        let dir = valid_fixture();
        let bundle = parse_bundle(VALID, dir.path(), &PlatformLimits::default()).unwrap();

        assert_eq!(bundle.name, "fix-health-endpoint");
        assert_eq!(bundle.version.as_deref(), Some("1.0"));
        assert_eq!(bundle.resources.memory_mb, 4096);
        assert_eq!(bundle.timeouts.build, Duration::from_secs(600));
        assert_eq!(bundle.environment.workdir, "/app");
        assert_eq!(
            bundle.environment.source,
            BuildSource::Dockerfile(PathBuf::from("Dockerfile"))
        );
        assert_eq!(bundle.readiness.checks.len(), 1);
        assert_eq!(
            bundle.readiness.checks[0].target,
            ProbeTarget::Http {
                url: "http://127.0.0.1:8080/health".to_string(),
                status: 200
            }
        );
        assert_eq!(bundle.verifier.reward_mode, RewardMode::Partial);
        assert_eq!(bundle.verifier.total_weight(), 3.0);
        assert!(bundle.solution.is_some());
        assert_eq!(bundle.digest.len(), 64);
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let dir = valid_fixture();
        let bundle = parse_bundle(VALID, dir.path(), &PlatformLimits::default()).unwrap();
        assert_eq!(
            bundle.extra.get("benchmark"),
            Some(&Value::String("terminal-bench".to_string()))
        );
        assert!(bundle.metadata.extra.contains_key("author_notes"));
        assert!(bundle.resources.extra.contains_key("gpu"));
        assert!(bundle.timeouts.extra.contains_key("grace_sec"));
        assert!(bundle.readiness.extra.contains_key("warmup"));
        assert!(bundle.readiness.checks[0].extra.contains_key("owner"));
        assert!(bundle.solution.unwrap().extra.contains_key("author"));
        assert!(bundle.verifier.extra.contains_key("runner"));
        assert_eq!(
            bundle.verifier.checks[0].extra.get("description"),
            Some(&Value::String("creates a record".to_string()))
        );
        assert!(bundle.verifier.checks[1].extra.is_empty());
    }

    #[test]
    fn test_weights_require_partial_mode() {
        let dir = valid_fixture();
        let yaml = VALID.replace("  reward_mode: partial\n", "");
        let err = parse_bundle(&yaml, dir.path(), &PlatformLimits::default()).unwrap_err();
        let violations = err.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "verifier.reward_mode");
        assert_eq!(violations[0].reason, "weights require reward_mode: partial");

        let explicit = VALID.replace("  reward_mode: partial\n", "  reward_mode: binary\n");
        assert!(parse_bundle(&explicit, dir.path(), &PlatformLimits::default()).is_err());

        let unweighted = yaml.replace("      weight: 2\n", "      weight: 1\n");
        let bundle = parse_bundle(&unweighted, dir.path(), &PlatformLimits::default()).unwrap();
        assert_eq!(bundle.verifier.reward_mode, RewardMode::Binary);
    }

    #[test]
    fn test_tcp_port_may_name_service_port() {
        let dir = valid_fixture();
        let check = |port: &str| {
            VALID.replace(
                "      http: { url: \"http://127.0.0.1:8080/health\" }\n",
                &format!("      tcp: {{ host: 127.0.0.1, port: {port} }}\n"),
            )
        };
        let target = |yaml: &str| {
            parse_bundle(yaml, dir.path(), &PlatformLimits::default())
                .map(|b| b.readiness.checks[0].target.clone())
        };

        for service in ["\"$FORGE_PORT\"", "\"${FORGE_PORT}\""] {
            assert_eq!(
                target(&check(service)).unwrap(),
                ProbeTarget::Tcp {
                    host: "127.0.0.1".to_string(),
                    port: TargetPort::Service
                }
            );
        }
        assert_eq!(
            target(&check("5432")).unwrap(),
            ProbeTarget::Tcp {
                host: "127.0.0.1".to_string(),
                port: TargetPort::Fixed(5432)
            }
        );
        for bad in ["0", "70000", "\"$OTHER_PORT\""] {
            let err = target(&check(bad)).unwrap_err();
            assert_eq!(err.violations()[0].field, "readiness.checks[0].tcp.port");
        }
    }

    #[test]
    fn test_missing_timeout_is_invalid() {
        let dir = valid_fixture();
        let yaml = VALID.replace("  verifier_sec: 300\n", "");
        let err = parse_bundle(&yaml, dir.path(), &PlatformLimits::default()).unwrap_err();
        let violations = err.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "timeouts.verifier_sec");
    }

    #[test]
    fn test_every_violation_is_reported() {
        let dir = valid_fixture();
        let yaml = VALID
            .replace("  cpus: 2\n", "  cpus: 0\n")
            .replace("  memory_mb: 4096\n", "  memory_mb: 999999999\n")
            .replace("  build_sec: 600\n", "  build_sec: -5\n")
            .replace("  reward_mode: partial\n", "  reward_mode: fuzzy\n");
        let err = parse_bundle(&yaml, dir.path(), &PlatformLimits::default()).unwrap_err();
        let fields: Vec<&str> = err.violations().iter().map(|v| v.field.as_str()).collect();
        assert!(fields.contains(&"resources.cpus"));
        assert!(fields.contains(&"resources.memory_mb"));
        assert!(fields.contains(&"timeouts.build_sec"));
        assert!(fields.contains(&"verifier.reward_mode"));
        assert_eq!(fields.len(), 4);
    }

    #[test]
    fn test_environment_sources_are_exclusive() {
        let dir = valid_fixture();
        let yaml = VALID.replace(
            "  dockerfile: Dockerfile\n",
            "  dockerfile: Dockerfile\n  image: alpine\n",
        );
        let err = parse_bundle(&yaml, dir.path(), &PlatformLimits::default()).unwrap_err();
        assert_eq!(err.violations()[0].field, "environment");
    }

    #[test]
    fn test_entrypoint_and_check_commands_conflict() {
        let dir = valid_fixture();
        let yaml = VALID.replace(
            "    - id: test_create\n",
            "    - id: test_create\n      command: pytest\n",
        );
        let err = parse_bundle(&yaml, dir.path(), &PlatformLimits::default()).unwrap_err();
        assert!(err
            .violations()
            .iter()
            .any(|v| v.field == "verifier.checks"));
    }

    #[test]
    fn test_command_mode_and_duplicate_ids() {
        let dir = fixture(&[]);
        let yaml = r#"
name: cmd-task
resources: { cpus: 1, memory_mb: 512, storage_mb: 1024 }
timeouts: { build_sec: 60, agent_sec: 60, verifier_sec: 60 }
environment:
  build_command: "true"
verifier:
  checks:
    - { id: a, command: "true" }
    - { id: a, command: "false" }
"#;
        let err = parse_bundle(yaml, dir.path(), &PlatformLimits::default()).unwrap_err();
        assert_eq!(err.violations()[0].field, "verifier.checks[1].id");

        let fixed = yaml.replace("{ id: a, command: \"false\" }", "{ id: b, command: \"false\" }");
        let bundle = parse_bundle(&fixed, dir.path(), &PlatformLimits::default()).unwrap();
        assert_eq!(bundle.verifier.mode, VerifierMode::Commands);
        assert_eq!(bundle.verifier.reward_mode, RewardMode::Binary);
        assert!(bundle.solution.is_none());
        assert!(bundle.verifier.dir.is_none());
    }

    #[test]
    fn test_readiness_check_needs_one_target() {
        let dir = valid_fixture();
        let yaml = VALID.replace(
            "      http: { url: \"http://127.0.0.1:8080/health\" }\n",
            "      tcp: { host: localhost, port: 80 }\n      command: \"true\"\n",
        );
        let err = parse_bundle(&yaml, dir.path(), &PlatformLimits::default()).unwrap_err();
        assert_eq!(err.violations()[0].field, "readiness.checks[0]");
    }

    #[test]
    fn test_malformed_yaml_and_missing_bundle() {
        let dir = valid_fixture();
        let err = parse_bundle("name: [unclosed", dir.path(), &PlatformLimits::default())
            .unwrap_err();
        assert_eq!(err.violations()[0].field, BUNDLE_FILE);

        let missing = dir.path().join("nope");
        assert!(matches!(
            load_bundle(&missing, &PlatformLimits::default()),
            Err(BundleError::NotFound(_))
        ));
    }

    #[test]
    fn test_digest_tracks_build_context() {
        let dir = valid_fixture();
        fs::write(dir.path().join(BUNDLE_FILE), VALID).unwrap();
        let first = load_bundle(dir.path(), &PlatformLimits::default()).unwrap();
        let again = load_bundle(dir.path(), &PlatformLimits::default()).unwrap();
        assert_eq!(first.digest, again.digest);

        fs::write(
            dir.path().join("environment/requirements.txt"),
            "flask==3.0\n",
        )
        .unwrap();
        let changed = load_bundle(dir.path(), &PlatformLimits::default()).unwrap();
        assert_ne!(first.digest, changed.digest);
        assert_eq!(first.build_key().name, changed.build_key().name);
    }
}
