//! Textual diffs between canonical YAML renderings of resource states.
//!
//! Resources are rendered with canonical field order, so the line diff is
//! stable across runs and shows exactly the fields that changed.

use common::{
    eyre::Result,
    similar::{ChangeTag, TextDiff},
};

use crate::Resource;

/// A line diff from `before` to `after`
///
/// Unchanged lines are kept (prefixed with a space) so single-field changes
/// still read in the context of the whole state.
pub fn unified(before: &str, after: &str) -> Vec<String> {
    TextDiff::from_lines(before, after)
        .iter_all_changes()
        .map(|change| {
            let tag = match change.tag() {
                ChangeTag::Delete => '-',
                ChangeTag::Insert => '+',
                ChangeTag::Equal => ' ',
            };
            format!("{tag}{}", change.value().trim_end_matches('\n'))
        })
        .collect()
}

/// Diff two (possibly missing) resources by their canonical renderings
pub fn resources(before: Option<&Resource>, after: Option<&Resource>) -> Result<Vec<String>> {
    let before_yaml = match before {
        Some(resource) => resource.canonical_yaml()?,
        None => String::new(),
    };
    let after_yaml = match after {
        Some(resource) => resource.canonical_yaml()?,
        None => String::new(),
    };
    Ok(unified(&before_yaml, &after_yaml))
}

/// Whether a diff contains any change at all
pub fn has_changes(lines: &[String]) -> bool {
    lines
        .iter()
        .any(|line| line.starts_with('-') || line.starts_with('+'))
}

#[cfg(test)]
mod tests {
    use common::serde_yaml;

    use crate::decode;

    use super::*;

    fn file(yaml: &str) -> Resource {
        decode("File", serde_yaml::from_str(yaml).expect("yaml")).expect("decode")
    }

    #[test]
    fn shows_changed_fields_with_context() -> Result<()> {
        let before = file("{path: /tmp/x, regular_file: bar, mode: '0644'}");
        let after = file("{path: /tmp/x, regular_file: bar, mode: '0600'}");

        let lines = resources(Some(&before), Some(&after))?;
        assert!(lines.iter().any(|line| line.starts_with("-mode:")));
        assert!(lines.iter().any(|line| line.starts_with("+mode:")));
        assert!(lines.iter().any(|line| line == " path: /tmp/x"));
        assert!(has_changes(&lines));

        Ok(())
    }

    #[test]
    fn identical_states_have_no_changes() -> Result<()> {
        let resource = file("{path: /tmp/x, regular_file: bar}");
        let lines = resources(Some(&resource), Some(&resource))?;
        assert!(!has_changes(&lines));
        Ok(())
    }

    #[test]
    fn missing_sides_diff_against_nothing() -> Result<()> {
        let resource = file("{path: /tmp/x, regular_file: bar}");

        let created = resources(None, Some(&resource))?;
        assert!(created.iter().all(|line| line.starts_with('+')));

        let deleted = resources(Some(&resource), None)?;
        assert!(deleted.iter().all(|line| line.starts_with('-')));

        Ok(())
    }
}
