use anyhow::{Context, Result};

use skyforge_common::AppConfig;

use crate::args::Args;

/// Loads the config file and applies command-line overrides.
pub fn load_config(args: &Args) -> Result<AppConfig> {
    let mut cfg = AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let region = args
        .region
        .clone()
        .or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()));
    apply_overrides(&mut cfg, region, args.account.clone(), args.model.clone());
    Ok(cfg)
}

fn apply_overrides(
    cfg: &mut AppConfig,
    region: Option<String>,
    account: Option<String>,
    model: Option<String>,
) {
    if let Some(region) = region {
        cfg.env.region = region;
    }
    if account.is_some() {
        cfg.env.account = account;
    }
    if let Some(model) = model {
        cfg.service.inference.model = model;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let mut cfg = AppConfig::default();
        apply_overrides(
            &mut cfg,
            Some("us-west-2".into()),
            Some("123456789012".into()),
            Some("Qwen/Qwen2.5-7B-Instruct".into()),
        );
        assert_eq!(cfg.env.region, "us-west-2");
        assert_eq!(cfg.env.account_or_default(), "123456789012");
        assert_eq!(cfg.service.inference.model, "Qwen/Qwen2.5-7B-Instruct");
    }

    #[test]
    fn test_no_overrides_keeps_file_values() {
        let mut cfg = AppConfig::from_json(r#"{ "env": { "account": "999" } }"#).unwrap();
        apply_overrides(&mut cfg, None, None, None);
        assert_eq!(cfg.env.account.as_deref(), Some("999"));
        assert_eq!(cfg.env.region, "us-east-1");
    }
}
