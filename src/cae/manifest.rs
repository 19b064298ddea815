//! Transfer manifest parsing.
//!
//! The manifest's top-level `transfers` key is a sequence of entries with
//! required `src`/`dst`/`format` fields. Access tokens expand `${VAR}`
//! environment references. Any shape violation surfaces as
//! `manifest-invalid` with the offending entry's position.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Regex filters applied to sub-stream names of hierarchical sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetFilter {
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// One transfer entry, resolved and ready to schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssimilationCtx {
    pub src: String,
    pub dst: String,
    pub format: String,
    #[serde(default)]
    pub depends_on: String,
    #[serde(default)]
    pub range_off: u64,
    /// 0 means the full stream.
    #[serde(default)]
    pub range_size: u64,
    #[serde(default)]
    pub src_token: String,
    #[serde(default)]
    pub dst_token: String,
    #[serde(default)]
    pub dataset_filter: Option<DatasetFilter>,
}

/// Expand `${VAR}` references from the process environment. Unset
/// variables expand to the empty string.
pub fn expand_env(raw: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    re.replace_all(raw, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Parse manifest text into an ordered list of transfer entries.
pub fn parse_manifest(text: &str) -> Result<Vec<AssimilationCtx>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|err| RuntimeError::ManifestInvalid(format!("not valid YAML: {err}")))?;
    let transfers = doc
        .get("transfers")
        .ok_or_else(|| RuntimeError::ManifestInvalid("missing required 'transfers' key".into()))?;
    let entries = transfers
        .as_sequence()
        .ok_or_else(|| RuntimeError::ManifestInvalid("'transfers' must be a sequence".into()))?;

    let mut out = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        for field in ["src", "dst", "format"] {
            if entry.get(field).and_then(|v| v.as_str()).is_none() {
                return Err(RuntimeError::ManifestInvalid(format!(
                    "transfer {} missing required '{field}' field",
                    i + 1
                )));
            }
        }
        let mut ctx: AssimilationCtx = serde_yaml::from_value(entry.clone())
            .map_err(|err| RuntimeError::ManifestInvalid(format!("transfer {}: {err}", i + 1)))?;
        ctx.src_token = expand_env(&ctx.src_token);
        ctx.dst_token = expand_env(&ctx.dst_token);
        tracing::debug!(
            src = %ctx.src,
            dst = %ctx.dst,
            format = %ctx.format,
            "loaded transfer {}/{}",
            i + 1,
            entries.len()
        );
        out.push(ctx);
    }
    Ok(out)
}

/// Load and parse a manifest file.
pub fn load_manifest(path: &Path) -> Result<Vec<AssimilationCtx>> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        RuntimeError::ManifestInvalid(format!("cannot read {}: {err}", path.display()))
    })?;
    parse_manifest(&text)
}

/// Split a `scheme::path` locator.
pub fn split_locator(locator: &str) -> Result<(&str, &str)> {
    locator
        .split_once("::")
        .ok_or_else(|| RuntimeError::ManifestInvalid(format!("'{locator}' is not scheme::path")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_entry() {
        let text = r#"
transfers:
  - src: "file::/tmp/input.bin"
    dst: "iowarp::raw_data"
    format: binary
    range_off: 1024
    range_size: 2048
    depends_on: "iowarp::earlier"
    dataset_filter:
      include_patterns: ["^/data/.*"]
      exclude_patterns: [".*tmp.*"]
"#;
        let entries = parse_manifest(text).unwrap();
        assert_eq!(entries.len(), 1);
        let ctx = &entries[0];
        assert_eq!(ctx.src, "file::/tmp/input.bin");
        assert_eq!(ctx.range_off, 1024);
        assert_eq!(ctx.range_size, 2048);
        assert_eq!(ctx.depends_on, "iowarp::earlier");
        let filter = ctx.dataset_filter.as_ref().unwrap();
        assert_eq!(filter.include_patterns, vec!["^/data/.*"]);
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let text = "transfers:\n  - src: \"file::/a\"\n    format: binary\n";
        let err = parse_manifest(text).unwrap_err();
        assert!(matches!(err, RuntimeError::ManifestInvalid(msg) if msg.contains("dst")));
    }

    #[test]
    fn non_sequence_transfers_is_invalid() {
        let err = parse_manifest("transfers: 42\n").unwrap_err();
        assert!(matches!(err, RuntimeError::ManifestInvalid(msg) if msg.contains("sequence")));
    }

    #[test]
    fn missing_transfers_key_is_invalid() {
        let err = parse_manifest("other: []\n").unwrap_err();
        assert!(matches!(err, RuntimeError::ManifestInvalid(_)));
    }

    #[test]
    fn empty_transfers_is_valid() {
        assert!(parse_manifest("transfers: []\n").unwrap().is_empty());
    }

    #[test]
    fn tokens_expand_environment() {
        std::env::set_var("CAE_TEST_TOKEN", "sekrit");
        let text = "transfers:\n  - src: \"file::/a\"\n    dst: \"iowarp::t\"\n    format: binary\n    src_token: \"bearer ${CAE_TEST_TOKEN}\"\n";
        let entries = parse_manifest(text).unwrap();
        assert_eq!(entries[0].src_token, "bearer sekrit");
    }

    #[test]
    fn locator_split() {
        assert_eq!(split_locator("file::/tmp/x").unwrap(), ("file", "/tmp/x"));
        assert!(split_locator("no-scheme").is_err());
    }
}
