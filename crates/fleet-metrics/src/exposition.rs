//! Prometheus text exposition format.
//!
//! Parses the payload a runner's exporter serves into metric families,
//! reduces them to one flat `MetricSample` per runner, and renders the
//! controller's own counters back into the same format.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use tracing::debug;

use fleet_state::MetricSample;

use crate::error::ExpositionError;

/// Counter whose per-container series are averaged instead of overwritten.
pub const CPU_SECONDS_TOTAL: &str = "ecs_cpu_seconds_total";

/// Declared type of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricType {
    fn from_keyword(s: &str) -> Self {
        match s {
            "counter" => MetricType::Counter,
            "gauge" => MetricType::Gauge,
            "histogram" => MetricType::Histogram,
            "summary" => MetricType::Summary,
            _ => MetricType::Untyped,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
            MetricType::Untyped => "untyped",
        }
    }
}

/// One sample line.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Series {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            value,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// All series sharing one metric name (plus histogram/summary suffixes).
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub kind: MetricType,
    pub help: Option<String>,
    pub series: Vec<Series>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, kind: MetricType) -> Self {
        Self {
            name: name.into(),
            kind,
            help: None,
            series: Vec::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_series(mut self, series: Series) -> Self {
        self.series.push(series);
        self
    }
}

/// Parse exposition text into metric families, in order of first appearance.
///
/// Framing errors (bad names, unterminated label blocks or quotes, missing
/// values) fail the whole payload. A sample whose value is not a number is
/// skipped on its own.
pub fn parse(text: &str) -> Result<Vec<MetricFamily>, ExpositionError> {
    let mut families: Vec<MetricFamily> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            parse_comment(comment, line_no, &mut families, &mut index)?;
            continue;
        }

        let Some((name, labels, value)) = parse_sample(line, line_no)? else {
            continue;
        };

        let idx = match family_for(&name, &families, &index) {
            Some(idx) => idx,
            None => {
                families.push(MetricFamily::new(name.clone(), MetricType::Untyped));
                index.insert(name.clone(), families.len() - 1);
                families.len() - 1
            }
        };
        families[idx].series.push(Series {
            name,
            labels,
            value,
        });
    }

    Ok(families)
}

/// Reduce parsed families to one flat sample for a runner.
///
/// Only gauge and counter series labelled `container="{container}"` are
/// kept. `ecs_cpu_seconds_total` is averaged across matching series; every
/// other metric keeps its last matching value. `NaN` and infinite values
/// have no JSON form and are left out of the sample.
pub fn reduce(families: &[MetricFamily], container: &str, timestamp: u64) -> MetricSample {
    let mut sample = MetricSample::new(timestamp);

    for family in families {
        if !matches!(family.kind, MetricType::Gauge | MetricType::Counter) {
            continue;
        }
        let matching = family
            .series
            .iter()
            .filter(|s| s.labels.get("container").map(String::as_str) == Some(container))
            .filter(|s| {
                let finite = s.value.is_finite();
                if !finite {
                    debug!(metric = %s.name, value = %s.value, "dropping non-finite value");
                }
                finite
            });

        if family.name == CPU_SECONDS_TOTAL {
            let (sum, count) = matching.fold((0.0, 0u32), |(sum, n), s| (sum + s.value, n + 1));
            let avg = if count > 0 { sum / count as f64 } else { 0.0 };
            sample.insert(family.name.clone(), avg);
            continue;
        }

        if let Some(last) = matching.last() {
            sample.insert(family.name.clone(), last.value);
        }
    }

    sample
}

/// Render metric families into exposition text.
pub fn render(families: &[MetricFamily]) -> String {
    let mut out = String::new();

    for family in families {
        if let Some(help) = &family.help {
            let _ = writeln!(out, "# HELP {} {}", family.name, help);
        }
        let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind.keyword());
        for s in &family.series {
            out.push_str(&s.name);
            if !s.labels.is_empty() {
                out.push('{');
                for (i, (k, v)) in s.labels.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{k}=\"{}\"", escape_label(v));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", s.value);
        }
    }

    out
}

fn parse_comment(
    comment: &str,
    line_no: usize,
    families: &mut Vec<MetricFamily>,
    index: &mut HashMap<String, usize>,
) -> Result<(), ExpositionError> {
    let mut parts = comment.trim_start().splitn(3, char::is_whitespace);
    let keyword = parts.next().unwrap_or_default();
    if keyword != "TYPE" && keyword != "HELP" {
        return Ok(());
    }

    let name = parts.next().unwrap_or_default();
    if !is_metric_name(name) {
        return Err(ExpositionError::new(
            line_no,
            format!("invalid metric name in {keyword} line"),
        ));
    }
    let rest = parts.next().unwrap_or_default().trim();

    let idx = match index.get(name) {
        Some(&idx) => idx,
        None => {
            families.push(MetricFamily::new(name, MetricType::Untyped));
            index.insert(name.to_string(), families.len() - 1);
            families.len() - 1
        }
    };

    if keyword == "TYPE" {
        if rest.is_empty() {
            return Err(ExpositionError::new(line_no, "TYPE line without a type"));
        }
        families[idx].kind = MetricType::from_keyword(rest);
    } else {
        families[idx].help = Some(rest.to_string());
    }
    Ok(())
}

/// Find the family a sample name belongs to, honoring histogram and
/// summary suffixes.
fn family_for(
    name: &str,
    families: &[MetricFamily],
    index: &HashMap<String, usize>,
) -> Option<usize> {
    if let Some(&idx) = index.get(name) {
        return Some(idx);
    }
    ["_bucket", "_sum", "_count"].iter().find_map(|suffix| {
        let base = name.strip_suffix(suffix)?;
        let &idx = index.get(base)?;
        matches!(
            families[idx].kind,
            MetricType::Histogram | MetricType::Summary
        )
        .then_some(idx)
    })
}

type Sample = (String, BTreeMap<String, String>, f64);

fn parse_sample(line: &str, line_no: usize) -> Result<Option<Sample>, ExpositionError> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if !is_metric_name(name) {
        return Err(ExpositionError::new(line_no, format!("invalid metric name {name:?}")));
    }

    let mut rest = &line[name_end..];
    let mut labels = BTreeMap::new();
    if let Some(block) = rest.strip_prefix('{') {
        let consumed = parse_labels(block, line_no, &mut labels)?;
        rest = &block[consumed..];
    }

    let mut tokens = rest.split_whitespace();
    let Some(raw_value) = tokens.next() else {
        return Err(ExpositionError::new(line_no, "missing sample value"));
    };
    if let Some(ts) = tokens.next() {
        if ts.parse::<i64>().is_err() {
            return Err(ExpositionError::new(line_no, format!("invalid timestamp {ts:?}")));
        }
    }
    if tokens.next().is_some() {
        return Err(ExpositionError::new(line_no, "trailing tokens after sample"));
    }

    match raw_value.parse::<f64>() {
        Ok(value) => Ok(Some((name.to_string(), labels, value))),
        Err(_) => {
            debug!(line = line_no, metric = %name, value = %raw_value, "skipping non-numeric sample");
            Ok(None)
        }
    }
}

/// Parse `k="v",...}` and return the number of bytes consumed, including
/// the closing brace.
fn parse_labels(
    block: &str,
    line_no: usize,
    labels: &mut BTreeMap<String, String>,
) -> Result<usize, ExpositionError> {
    let bytes = block.as_bytes();
    let mut pos = 0;

    loop {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        match bytes.get(pos) {
            Some(b'}') => return Ok(pos + 1),
            Some(_) => {}
            None => return Err(ExpositionError::new(line_no, "unterminated label block")),
        }

        let key_start = pos;
        while pos < bytes.len() && bytes[pos] != b'=' && bytes[pos] != b'}' && bytes[pos] != b',' {
            pos += 1;
        }
        let key = block[key_start..pos].trim();
        if !is_label_name(key) {
            return Err(ExpositionError::new(line_no, format!("invalid label name {key:?}")));
        }
        if bytes.get(pos) != Some(&b'=') {
            return Err(ExpositionError::new(line_no, format!("label {key} has no value")));
        }
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if bytes.get(pos) != Some(&b'"') {
            return Err(ExpositionError::new(line_no, format!("label {key} value is not quoted")));
        }
        pos += 1;

        let mut value = String::new();
        let mut chars = block[pos..].char_indices();
        let mut closed = false;
        while let Some((off, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, other)) => value.push(other),
                    None => break,
                },
                '"' => {
                    pos += off + 1;
                    closed = true;
                    break;
                }
                other => value.push(other),
            }
        }
        if !closed {
            return Err(ExpositionError::new(line_no, "unterminated label value"));
        }
        labels.insert(key.to_string(), value);

        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        match bytes.get(pos) {
            Some(b',') => pos += 1,
            Some(b'}') => return Ok(pos + 1),
            _ => return Err(ExpositionError::new(line_no, "expected ',' or '}' after label")),
        }
    }
}

fn is_metric_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_label_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
