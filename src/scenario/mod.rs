// Scenario catalog: test suites loaded from YAML files
//
// The catalog owns every suite, scenario, party and step. Parts refer back to
// their parents through index handles (`ScenarioId`, `StepRef`), so the tree
// can be shared read-only between concurrent runs.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::GossipError;
use crate::sip::message::SipType;
use crate::template::Template;

/// Nature of address used when a step names none
pub const DEFAULT_NOA: &str = "2";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStep {
    alias: Option<String>,
    previous: Option<String>,
    next: Option<String>,
    delay: Option<String>,
    out: Option<String>,
    to: Option<String>,
    noa: Option<String>,
    headers: Option<String>,
    allow: String,
    supported: String,
    required: String,
    sdp: String,
    tags: String,
    templates: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawParty {
    number: String,
    #[serde(default)]
    noa: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawTest {
    name: String,
    #[serde(default)]
    calls: Vec<RawParty>,
}

#[derive(Debug, Deserialize)]
struct RawSuite {
    suite: String,
    #[serde(default)]
    tests: Vec<RawTest>,
}

/// One step of a party, prepared at load time.
#[derive(Debug, Clone, Default)]
pub struct CallStep {
    pub alias: Option<String>,
    /// Alias of the message this one continues
    pub previous: Option<String>,
    /// Alias of the step to jump to afterwards
    pub next: Option<String>,
    pub delay: Option<Duration>,
    pub out: Option<SipType>,
    pub to: Option<String>,
    pub noa: Option<String>,
    pub headers: Option<Template>,
    pub allow: BTreeSet<String>,
    pub supported: BTreeSet<String>,
    pub required: BTreeSet<String>,
    pub sdp: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    /// Per-name overrides of built-in templates, keyed by lower-cased name
    pub templates: BTreeMap<String, Template>,
}

fn tag_set(s: &str) -> BTreeSet<String> {
    s.split_whitespace().map(|t| t.to_string()).collect()
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl CallStep {
    fn prepare(raw: RawStep) -> Result<CallStep, String> {
        let delay = match non_empty(raw.delay) {
            Some(d) => Some(parse_duration(&d)?),
            None => None,
        };
        let out = match non_empty(raw.out) {
            Some(o) => Some(SipType::parse(&o).ok_or_else(|| format!("unknown message type '{}'", o))?),
            None => None,
        };
        let headers = match raw.headers {
            Some(h) if !h.trim().is_empty() => {
                Some(Template::parse(&h).map_err(|e| format!("headers template: {}", e))?)
            }
            _ => None,
        };
        let mut templates = BTreeMap::new();
        for (name, source) in raw.templates {
            let t = Template::parse(&source).map_err(|e| format!("template '{}': {}", name, e))?;
            templates.insert(name.to_ascii_lowercase(), t);
        }
        Ok(CallStep {
            alias: non_empty(raw.alias),
            previous: non_empty(raw.previous),
            next: non_empty(raw.next),
            delay,
            out,
            to: non_empty(raw.to),
            noa: non_empty(raw.noa),
            headers,
            allow: tag_set(&raw.allow),
            supported: tag_set(&raw.supported),
            required: tag_set(&raw.required),
            sdp: tag_set(&raw.sdp),
            tags: tag_set(&raw.tags),
            templates,
        })
    }

    pub fn template(&self, name: &str) -> Option<&Template> {
        self.templates.get(&name.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone)]
pub struct CallParty {
    pub number: String,
    pub noa: String,
    pub steps: Vec<CallStep>,
    aliases: HashMap<String, usize>,
}

impl CallParty {
    pub fn new(number: impl Into<String>, noa: impl Into<String>, steps: Vec<CallStep>) -> Result<Self, String> {
        let number = number.into();
        let mut aliases = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if let Some(alias) = &step.alias {
                if aliases.insert(alias.clone(), i).is_some() {
                    return Err(format!("party {}: duplicate alias '{}'", number, alias));
                }
            }
        }
        for (i, step) in steps.iter().enumerate() {
            for target in step.previous.iter().chain(step.next.iter()) {
                if !aliases.contains_key(target) {
                    return Err(format!("party {} step {}: unknown alias '{}'", number, i + 1, target));
                }
            }
        }
        Ok(Self {
            number,
            noa: noa.into(),
            steps,
            aliases,
        })
    }

    /// Step index carrying `alias`
    pub fn step_index(&self, alias: &str) -> Option<usize> {
        self.aliases.get(alias).copied()
    }

    pub fn aliases(&self) -> &HashMap<String, usize> {
        &self.aliases
    }
}

#[derive(Debug, Clone)]
pub struct SingleTest {
    pub name: String,
    pub parties: Vec<CallParty>,
}

#[derive(Debug, Clone)]
pub struct TestSuite {
    pub name: String,
    pub file: String,
    pub tests: Vec<SingleTest>,
}

/// Identity of a scenario inside a catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScenarioId {
    pub suite: usize,
    pub test: usize,
}

/// Identity of a step inside a catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepRef {
    pub scenario: ScenarioId,
    pub party: usize,
    pub step: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    suites: Vec<TestSuite>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_suites(suites: Vec<TestSuite>) -> Self {
        Self { suites }
    }

    /// Walk files and directories and load every regular file as a suite.
    pub fn load_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Catalog, GossipError> {
        let mut catalog = Catalog::new();
        for path in paths {
            let mut files = Vec::new();
            collect_files(path.as_ref(), &mut files)?;
            for file in files {
                tracing::info!(file = %file.display(), "reading scenario file");
                let text = std::fs::read_to_string(&file).map_err(|e| GossipError::ScenarioFile {
                    path: file.display().to_string(),
                    message: e.to_string(),
                })?;
                catalog.add_suite_str(&file.display().to_string(), &text)?;
            }
        }
        Ok(catalog)
    }

    /// Parse one suite document and add it to the catalog.
    pub fn add_suite_str(&mut self, file: &str, text: &str) -> Result<(), GossipError> {
        let file_err = |message: String| GossipError::ScenarioFile {
            path: file.to_string(),
            message,
        };
        let raw: RawSuite = serde_yaml::from_str(text).map_err(|e| file_err(e.to_string()))?;
        let mut tests = Vec::with_capacity(raw.tests.len());
        for raw_test in raw.tests {
            let mut parties = Vec::with_capacity(raw_test.calls.len());
            for raw_party in raw_test.calls {
                let number = raw_party.number.trim().to_string();
                if number.is_empty() {
                    return Err(file_err(format!("{}/{}: party without number", raw.suite, raw_test.name)));
                }
                let mut steps = Vec::with_capacity(raw_party.steps.len());
                for (i, raw_step) in raw_party.steps.into_iter().enumerate() {
                    let step = CallStep::prepare(raw_step).map_err(|m| {
                        file_err(format!("{}/{}:{} step {}: {}", raw.suite, raw_test.name, number, i + 1, m))
                    })?;
                    steps.push(step);
                }
                let noa = non_empty(raw_party.noa).unwrap_or_else(|| DEFAULT_NOA.to_string());
                let party = CallParty::new(number, noa, steps)
                    .map_err(|m| file_err(format!("{}/{}: {}", raw.suite, raw_test.name, m)))?;
                parties.push(party);
            }
            tests.push(SingleTest {
                name: raw_test.name,
                parties,
            });
        }
        self.suites.push(TestSuite {
            name: raw.suite,
            file: file.to_string(),
            tests,
        });
        Ok(())
    }

    pub fn suites(&self) -> &[TestSuite] {
        &self.suites
    }

    pub fn scenario(&self, id: ScenarioId) -> Option<&SingleTest> {
        self.suites.get(id.suite).and_then(|s| s.tests.get(id.test))
    }

    pub fn step(&self, at: StepRef) -> Option<&CallStep> {
        self.scenario(at.scenario)
            .and_then(|t| t.parties.get(at.party))
            .and_then(|p| p.steps.get(at.step))
    }

    /// All scenario ids in file order
    pub fn ids(&self) -> Vec<ScenarioId> {
        self.suites
            .iter()
            .enumerate()
            .flat_map(|(si, s)| (0..s.tests.len()).map(move |ti| ScenarioId { suite: si, test: ti }))
            .collect()
    }

    pub fn scenario_count(&self) -> usize {
        self.suites.iter().map(|s| s.tests.len()).sum()
    }

    /// `file: suite/test`
    pub fn describe_scenario(&self, id: ScenarioId) -> String {
        match (self.suites.get(id.suite), self.scenario(id)) {
            (Some(suite), Some(test)) => format!("{}: {}/{}", suite.file, suite.name, test.name),
            _ => format!("<unknown scenario {}.{}>", id.suite, id.test),
        }
    }

    /// `file: suite/test:number step N (alias)`
    pub fn describe(&self, at: StepRef) -> String {
        let base = self.describe_scenario(at.scenario);
        let Some(party) = self.scenario(at.scenario).and_then(|t| t.parties.get(at.party)) else {
            return base;
        };
        let mut s = format!("{}:{} step {}", base, party.number, at.step + 1);
        if let Some(alias) = party.steps.get(at.step).and_then(|st| st.alias.as_deref()) {
            s.push_str(&format!(" ({})", alias));
        }
        s
    }

    /// Scenario ids in run order: `loops` passes over the catalog, or endless when `continuous`.
    pub fn schedule(&self, loops: u32, continuous: bool) -> Schedule {
        Schedule {
            ids: self.ids(),
            pos: 0,
            loops_left: if continuous { None } else { Some(loops) },
        }
    }
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<(), GossipError> {
    let meta = std::fs::metadata(path).map_err(|e| GossipError::ScenarioFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if meta.is_dir() {
        let mut entries = std::fs::read_dir(path)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort();
        for entry in entries {
            collect_files(&entry, out)?;
        }
    } else if meta.is_file() {
        out.push(path.to_path_buf());
    } else {
        tracing::info!(path = %path.display(), "skipping non-regular file");
    }
    Ok(())
}

/// Iterator over scenario ids to run.
#[derive(Debug, Clone)]
pub struct Schedule {
    ids: Vec<ScenarioId>,
    pos: usize,
    loops_left: Option<u32>,
}

impl Iterator for Schedule {
    type Item = ScenarioId;

    fn next(&mut self) -> Option<ScenarioId> {
        if self.ids.is_empty() || self.loops_left == Some(0) {
            return None;
        }
        let id = self.ids[self.pos];
        self.pos += 1;
        if self.pos == self.ids.len() {
            self.pos = 0;
            if let Some(n) = self.loops_left.as_mut() {
                *n -= 1;
            }
        }
        Some(id)
    }
}

/// Parse durations like `150ms`, `2s`, `1m30s`, `1.5s`, `500us`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let invalid = || format!("invalid duration '{}'", s);
    let mut nanos: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(num_len);
        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let factor: u128 = match &tail[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            unit => return Err(format!("invalid unit '{}' in duration '{}'", unit, s)),
        };
        let int: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        nanos = int
            .checked_mul(factor)
            .and_then(|n| nanos.checked_add(n))
            .ok_or_else(invalid)?;
        if !frac_part.is_empty() {
            let frac_digits = &frac_part[..frac_part.len().min(12)];
            let frac: u128 = frac_digits.parse().map_err(|_| invalid())?;
            nanos = frac
                .checked_mul(factor)
                .map(|n| n / 10u128.pow(frac_digits.len() as u32))
                .and_then(|n| nanos.checked_add(n))
                .ok_or_else(invalid)?;
        }
        rest = &tail[unit_len..];
    }
    let secs = u64::try_from(nanos / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (nanos % 1_000_000_000) as u32))
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.suite, self.test)
    }
}
