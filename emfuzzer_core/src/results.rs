use chrono::{DateTime, Local};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Keys of the report that cannot be used as group names.
const RESERVED_KEYS: [&str; 3] = ["info", "all", "extra"];

#[derive(Error, Debug)]
pub enum ResultsError {
    #[error("Results group '{0}' is not registered")]
    UnknownGroup(String),
    #[error("Results group '{0}' is already registered")]
    DuplicateGroup(String),
    #[error("Name '{0}' is reserved in the report and cannot be used for a group")]
    ReservedGroup(String),
    #[error("Result '{tag}' is not part of the domain of group '{group}'")]
    UnknownTag { group: String, tag: String },
    #[error("Key '{key}' was already recorded in group '{group}'")]
    DuplicateKey { group: String, key: String },
    #[error("Results are already finished")]
    AlreadyFinished,
    #[error("Report I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A closed set of outcomes that can be aggregated in a [`ResultsGroup`].
pub trait Outcome: Copy + Eq + fmt::Debug + 'static {
    /// Every member of the domain, in report order.
    const ALL: &'static [Self];

    fn tag(self) -> &'static str;
}

/// Case keys grouped by the outcome they produced, for one validator or probe.
#[derive(Debug, Clone)]
pub struct ResultsGroup {
    name: String,
    entries: Vec<(&'static str, Vec<String>)>,
    success_tag: &'static str,
}

impl ResultsGroup {
    /// Pre-seeds an empty list for every member of `R` so the report always shows
    /// all categories.
    pub fn new<R: Outcome>(name: impl Into<String>, success: R) -> Self {
        Self {
            name: name.into(),
            entries: R::ALL.iter().map(|r| (r.tag(), Vec::new())).collect(),
            success_tag: success.tag(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collect<R: Outcome>(&mut self, key: &str, result: R) -> Result<(), ResultsError> {
        self.collect_tag(key, result.tag())
    }

    pub fn collect_tag(&mut self, key: &str, tag: &str) -> Result<(), ResultsError> {
        if self
            .entries
            .iter()
            .any(|(_, keys)| keys.iter().any(|k| k == key))
        {
            return Err(ResultsError::DuplicateKey {
                group: self.name.clone(),
                key: key.to_string(),
            });
        }
        let (_, keys) = self
            .entries
            .iter_mut()
            .find(|(t, _)| *t == tag)
            .ok_or_else(|| ResultsError::UnknownTag {
                group: self.name.clone(),
                tag: tag.to_string(),
            })?;
        keys.push(key.to_string());
        Ok(())
    }

    pub fn keys_for(&self, tag: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, keys)| keys.as_slice())
    }

    pub fn total(&self) -> usize {
        self.entries.iter().map(|(_, keys)| keys.len()).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.entries
            .iter()
            .filter(|(tag, _)| *tag != self.success_tag)
            .map(|(_, keys)| keys.len())
            .sum()
    }

    pub fn summary(&self, indent: &str) -> String {
        self.entries
            .iter()
            .map(|(tag, keys)| format!("{indent}{tag}: {}", keys.len()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Serialize for ResultsGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (tag, keys) in &self.entries {
            map.serialize_entry(tag, keys)?;
        }
        map.end()
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct RunInfo {
    pub version: String,
    pub args: serde_json::Value,
    pub config: serde_json::Value,
    pub start: DateTime<Local>,
    pub end: Option<DateTime<Local>>,
}

/// Everything recorded during one run; serialized once as the JSON report.
#[derive(Debug, Clone)]
pub struct Results {
    info: RunInfo,
    groups: Vec<ResultsGroup>,
    all: Vec<String>,
    extra: serde_json::Value,
}

impl Results {
    pub fn new(args: &impl Serialize, config: &impl Serialize) -> Result<Self, ResultsError> {
        Ok(Self {
            info: RunInfo {
                version: env!("CARGO_PKG_VERSION").to_string(),
                args: serde_json::to_value(args)?,
                config: serde_json::to_value(config)?,
                start: Local::now(),
                end: None,
            },
            groups: Vec::new(),
            all: Vec::new(),
            extra: serde_json::Value::Null,
        })
    }

    pub fn register<R: Outcome>(&mut self, group: &str, success: R) -> Result<(), ResultsError> {
        if RESERVED_KEYS.contains(&group) {
            return Err(ResultsError::ReservedGroup(group.to_string()));
        }
        if self.group(group).is_some() {
            return Err(ResultsError::DuplicateGroup(group.to_string()));
        }
        self.groups.push(ResultsGroup::new(group, success));
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&ResultsGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut ResultsGroup> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    pub fn collect<R: Outcome>(
        &mut self,
        group: &str,
        key: &str,
        result: R,
    ) -> Result<(), ResultsError> {
        self.group_mut(group)
            .ok_or_else(|| ResultsError::UnknownGroup(group.to_string()))?
            .collect(key, result)
    }

    /// Records a case and returns the key its results are filed under. A key seen
    /// before gets a `#<n>` suffix so each occurrence keeps its own results.
    pub fn add_key(&mut self, key: &str) -> String {
        let mut unique = key.to_string();
        let mut occurrence = 1;
        while self.all.contains(&unique) {
            occurrence += 1;
            unique = format!("{key}#{occurrence}");
        }
        if occurrence > 1 {
            warn!("Case {key} was already run, recording this run as {unique}");
        }
        self.all.push(unique.clone());
        unique
    }

    pub fn keys(&self) -> &[String] {
        &self.all
    }

    /// Freezes the run: stamps the end time and stores auxiliary counters.
    pub fn finish(&mut self, extra: &impl Serialize) -> Result<(), ResultsError> {
        if self.is_finished() {
            return Err(ResultsError::AlreadyFinished);
        }
        self.extra = serde_json::to_value(extra)?;
        self.info.end = Some(Local::now());
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.info.end.is_some()
    }

    pub fn total(&self) -> usize {
        self.groups.iter().map(ResultsGroup::total).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.groups.iter().map(ResultsGroup::total_errors).sum()
    }

    pub fn summary(&self) -> String {
        self.groups
            .iter()
            .map(|g| {
                format!(
                    "{} ({}/{}):\n{}",
                    g.name,
                    g.total_errors(),
                    g.total(),
                    g.summary("\t")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_json(&self) -> Result<serde_json::Value, ResultsError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Writes the pretty-printed report, UTF-8, with a trailing newline.
    pub fn write_report(&self, path: &Path) -> Result<(), ResultsError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl Serialize for Results {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.groups.len() + 3))?;
        map.serialize_entry("info", &self.info)?;
        for group in &self.groups {
            map.serialize_entry(&group.name, group)?;
        }
        map.serialize_entry("all", &self.all)?;
        map.serialize_entry("extra", &self.extra)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Verdict {
        Pass,
        Fail,
        Hang,
    }

    impl Outcome for Verdict {
        const ALL: &'static [Self] = &[Self::Pass, Self::Fail, Self::Hang];
        fn tag(self) -> &'static str {
            match self {
                Self::Pass => "pass",
                Self::Fail => "fail",
                Self::Hang => "hang",
            }
        }
    }

    fn results() -> Results {
        Results::new(&json!({"data": ["a.bin"]}), &json!({"target": {"port": 5683}})).unwrap()
    }

    #[test]
    fn registered_group_lists_every_tag() {
        let mut r = results();
        r.register("coap", Verdict::Pass).unwrap();
        let value = r.to_json().unwrap();
        assert_eq!(value["coap"], json!({"pass": [], "fail": [], "hang": []}));
    }

    #[test]
    fn error_count_excludes_success_tag() {
        let mut group = ResultsGroup::new("g", Verdict::Pass);
        group.collect("a", Verdict::Pass).unwrap();
        group.collect("b", Verdict::Fail).unwrap();
        group.collect("c", Verdict::Hang).unwrap();
        group.collect("d", Verdict::Pass).unwrap();

        assert_eq!(group.total(), 4);
        assert_eq!(group.total_errors(), 2);
        assert_eq!(
            group.total_errors(),
            group.total() - group.keys_for("pass").unwrap().len()
        );
    }

    #[test]
    fn totals_sum_over_groups() {
        let mut r = results();
        r.register("first", Verdict::Pass).unwrap();
        r.register("second", Verdict::Pass).unwrap();
        r.collect("first", "a", Verdict::Fail).unwrap();
        r.collect("first", "b", Verdict::Pass).unwrap();
        r.collect("second", "a", Verdict::Hang).unwrap();

        assert_eq!(r.total(), 3);
        assert_eq!(r.total_errors(), 2);
    }

    #[test]
    fn tag_outside_domain_is_rejected() {
        let mut group = ResultsGroup::new("g", Verdict::Pass);
        let err = group.collect_tag("a", "exploded").unwrap_err();
        assert!(matches!(err, ResultsError::UnknownTag { .. }));
        assert_eq!(group.total(), 0);
    }

    #[test]
    fn key_is_recorded_once_per_group() {
        let mut group = ResultsGroup::new("g", Verdict::Pass);
        group.collect("a", Verdict::Pass).unwrap();
        let err = group.collect("a", Verdict::Fail).unwrap_err();
        assert!(matches!(err, ResultsError::DuplicateKey { .. }));
        assert_eq!(group.total(), 1);
    }

    #[test]
    fn unknown_and_reserved_groups_are_rejected() {
        let mut r = results();
        assert!(matches!(
            r.collect("missing", "a", Verdict::Pass),
            Err(ResultsError::UnknownGroup(_))
        ));
        assert!(matches!(
            r.register("all", Verdict::Pass),
            Err(ResultsError::ReservedGroup(_))
        ));
        r.register("g", Verdict::Pass).unwrap();
        assert!(matches!(
            r.register("g", Verdict::Pass),
            Err(ResultsError::DuplicateGroup(_))
        ));
    }

    #[test]
    fn repeated_case_gets_its_own_key() {
        let mut r = results();
        r.register("coap", Verdict::Pass).unwrap();
        assert_eq!(r.add_key("a.bin"), "a.bin");
        assert_eq!(r.add_key("a.bin"), "a.bin#2");
        assert_eq!(r.add_key("b.bin"), "b.bin");
        assert_eq!(r.add_key("a.bin"), "a.bin#3");
        assert_eq!(r.keys(), ["a.bin", "a.bin#2", "b.bin", "a.bin#3"]);

        r.collect("coap", "a.bin", Verdict::Pass).unwrap();
        r.collect("coap", "a.bin#2", Verdict::Fail).unwrap();
        assert_eq!(r.total_errors(), 1);
    }

    #[test]
    fn summary_lists_counts_per_tag() {
        let mut r = results();
        r.register("coap", Verdict::Pass).unwrap();
        r.collect("coap", "a", Verdict::Fail).unwrap();
        assert_eq!(r.summary(), "coap (1/1):\n\tpass: 0\n\tfail: 1\n\thang: 0");
    }

    #[test]
    fn report_has_info_groups_all_and_extra() {
        let mut r = results();
        r.register("coap", Verdict::Pass).unwrap();
        r.add_key("a.bin");
        r.collect("coap", "a.bin", Verdict::Pass).unwrap();
        assert!(!r.is_finished());
        r.finish(&json!({"unexpected_messages": 3})).unwrap();
        assert!(r.is_finished());
        assert!(matches!(
            r.finish(&json!({})),
            Err(ResultsError::AlreadyFinished)
        ));

        let value = r.to_json().unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert!(keys.contains(&"info".to_string()));
        assert_eq!(value["all"], json!(["a.bin"]));
        assert_eq!(value["extra"], json!({"unexpected_messages": 3}));
        assert_eq!(value["info"]["args"], json!({"data": ["a.bin"]}));
        assert_eq!(value["info"]["config"]["target"]["port"], json!(5683));
        assert!(value["info"]["start"].is_string());
        assert!(value["info"]["end"].is_string());
    }

    #[test]
    fn report_file_ends_with_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut r = results();
        r.register("coap", Verdict::Pass).unwrap();
        r.finish(&json!({})).unwrap();
        r.write_report(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("}\n"));
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["coap"]["hang"], json!([]));
    }
}
