//! Unit tests for incident severity resolution

use escalade::services::incident::resolve_severity;
use pretty_assertions::assert_eq;
use rstest::rstest;

#[rstest]
#[case(Some("critical"), Some("major"), "minor", "critical")]
#[case(None, Some("major"), "minor", "major")]
#[case(None, None, "minor", "minor")]
#[case(Some("critical"), None, "minor", "critical")]
fn test_severity_precedence(
    #[case] requested: Option<&str>,
    #[case] label: Option<&str>,
    #[case] org_default: &str,
    #[case] expected: &str,
) {
    assert_eq!(resolve_severity(requested, label, org_default), expected);
}
