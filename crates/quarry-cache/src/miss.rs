//! Human-readable cache-miss diagnostics: a diff of the freshly computed
//! fingerprint against the previously persisted one. Purely informational;
//! nothing here affects cache correctness.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::fingerprint::InputData;

pub(crate) fn render_miss_report(
    package: &str,
    previous: Option<&InputData>,
    next: &InputData,
) -> String {
    let mut report = String::new();
    writeln!(report, "cache miss for {package}").ok();

    let Some(previous) = previous else {
        writeln!(report, "  no previous fingerprint recorded").ok();
        return report;
    };

    diff_section(
        &mut report,
        "file",
        &previous
            .file_hashes
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        &next
            .file_hashes
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    );
    diff_section(&mut report, "script", &previous.npm_scripts, &next.npm_scripts);
    diff_section(&mut report, "env var", &previous.env, &next.env);
    diff_section(&mut report, "version", &previous.versions, &next.versions);

    if previous.extra != next.extra {
        writeln!(report, "  dependency outputs changed").ok();
    }

    if report.lines().count() == 1 {
        writeln!(report, "  fingerprints match; miss caused by evicted cache data").ok();
    }

    report
}

fn diff_section(
    report: &mut String,
    label: &str,
    previous: &BTreeMap<String, String>,
    next: &BTreeMap<String, String>,
) {
    for (key, value) in next {
        match previous.get(key) {
            None => {
                writeln!(report, "  {label} added: {key}").ok();
            }
            Some(old) if old != value => {
                writeln!(report, "  {label} changed: {key}").ok();
            }
            Some(_) => {}
        }
    }
    for key in previous.keys() {
        if !next.contains_key(key) {
            writeln!(report, "  {label} removed: {key}").ok();
        }
    }
}

#[cfg(test)]
mod test {
    use quarry_paths::RelativeUnixPathBuf;

    use super::*;

    fn data(file: &str, hash: &str, env: &[(&str, &str)]) -> InputData {
        InputData {
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            file_hashes: [(RelativeUnixPathBuf::new(file).unwrap(), hash.to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_previous_fingerprint() {
        let next = data("src/a.ts", "h1", &[]);
        let report = render_miss_report("packages/a", None, &next);
        assert!(report.contains("no previous fingerprint"));
    }

    #[test]
    fn test_reports_changed_file_and_env() {
        let previous = data("src/a.ts", "h1", &[("CI", "true"), ("HOME", "/old")]);
        let next = data("src/a.ts", "h2", &[("CI", "true")]);
        let report = render_miss_report("packages/a", Some(&previous), &next);
        insta::assert_snapshot!(report, @r###"
        cache miss for packages/a
          file changed: src/a.ts
          env var removed: HOME
        "###);
    }

    #[test]
    fn test_reports_dependency_output_change() {
        let previous = InputData {
            extra: vec!["dep-hash-1".to_string()],
            ..Default::default()
        };
        let next = InputData {
            extra: vec!["dep-hash-2".to_string()],
            ..Default::default()
        };
        let report = render_miss_report("packages/a", Some(&previous), &next);
        assert!(report.contains("dependency outputs changed"));
    }
}
