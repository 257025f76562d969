//! `arbor eval` -- evaluate a reference against submitted values.

use std::fs;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use arbor_engine::SubmissionContext;

use crate::cli::EvalArgs;
use crate::context::RuntimeContext;
use crate::output::{format_evaluation, output_json};

pub fn run(ctx: &RuntimeContext, args: &EvalArgs) -> Result<()> {
    let submission = submission(args)?;
    let engine = ctx.open_engine()?;
    let evaluation = engine.evaluate(&args.reference, &submission)?;

    if ctx.json {
        output_json(&evaluation);
    } else {
        let empty = &engine.config().evaluation.empty_display;
        println!("{}", format_evaluation(&evaluation, empty));
    }
    Ok(())
}

/// Values from `--values`, then each `--set` on top.
fn submission(args: &EvalArgs) -> Result<SubmissionContext> {
    let mut submission = match &args.values {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON object of values", path.display()))?
        }
        None => SubmissionContext::new(),
    };
    for pair in &args.set {
        let (id, value) = parse_pair(pair)?;
        submission = submission.with(id, value);
    }
    Ok(submission)
}

/// `id=value`; the value is read as JSON when it parses, else as text.
fn parse_pair(pair: &str) -> Result<(String, Value)> {
    let Some((id, raw)) = pair.split_once('=') else {
        bail!("invalid --set '{pair}': expected ID=VALUE");
    };
    let id = id.trim();
    if id.is_empty() {
        bail!("invalid --set '{pair}': empty node id");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((id.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pair_values_are_json_when_possible() {
        assert_eq!(parse_pair("price=3").unwrap(), ("price".into(), json!(3)));
        assert_eq!(parse_pair("flag=true").unwrap(), ("flag".into(), json!(true)));
        assert_eq!(parse_pair("side=east").unwrap(), ("side".into(), json!("east")));
        assert_eq!(parse_pair("note=a=b").unwrap(), ("note".into(), json!("a=b")));
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(parse_pair("price").is_err());
        assert!(parse_pair("=3").is_err());
    }

    #[test]
    fn set_overrides_values_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("values.json");
        fs::write(&path, r#"{"a": 1, "b": 2}"#).unwrap();
        let args = EvalArgs {
            reference: "@value.a".into(),
            values: Some(path),
            set: vec!["b=5".into()],
        };
        let submission = submission(&args).unwrap();
        assert_eq!(submission.get("a"), Some(&json!(1)));
        assert_eq!(submission.get("b"), Some(&json!(5)));
    }
}
