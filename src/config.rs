//! Configuration loader and validator for broadcast campaigns.
use crate::filter::FilterPolicy;
use crate::model::{CampaignKey, DomainExclusion, Source, Window, MAX_DAYS_AGO};
use crate::provider::MAX_RECIPIENTS_PER_CALL;
use crate::template::{Template, TemplateError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Placeholders filled by the runner rather than by campaign `vars`.
pub const BUILTIN_VARS: [&str; 2] = ["name", "date"];

pub const DEFAULT_NAME: &str = "Customer";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Invalid message template: {0}")]
    Template(#[from] TemplateError),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub provider: Provider,
    pub campaigns: BTreeMap<String, Campaign>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub database_url: String,
    #[serde(default = "default_db_timeout_secs")]
    pub db_timeout_secs: u64,
}

/// Delivery provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provider {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    pub channel_token: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// One campaign definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Campaign {
    pub source: Source,
    pub window: Window,
    #[serde(default)]
    pub max_candidates: Option<u32>,
    #[serde(default)]
    pub filters: Filters,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub default_name: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub batch_delay_ms: Option<u64>,
}

/// Per-campaign filter toggles. Format validation and the once-ever rule are
/// on unless a campaign turns them off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filters {
    #[serde(default = "enabled")]
    pub validate_format: bool,
    #[serde(default = "enabled")]
    pub once_ever: bool,
    #[serde(default)]
    pub exclude_sent_under: Vec<CampaignKey>,
    #[serde(default)]
    pub domain: Option<DomainExclusion>,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            validate_format: true,
            once_ever: true,
            exclude_sent_under: Vec::new(),
            domain: None,
        }
    }
}

fn enabled() -> bool {
    true
}
fn default_db_timeout_secs() -> u64 {
    10
}
fn default_endpoint() -> String {
    "https://api.line.me/".to_string()
}
fn default_batch_size() -> usize {
    MAX_RECIPIENTS_PER_CALL
}
fn default_batch_delay_ms() -> u64 {
    200
}
fn default_timeout_secs() -> u64 {
    15
}

/// Operator-supplied settings for a single invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOverrides {
    pub dry_run: bool,
    pub test_recipient: Option<String>,
    pub batch_size: Option<usize>,
}

/// Validated, immutable settings for one campaign run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub key: CampaignKey,
    pub source: Source,
    pub window: Window,
    pub max_candidates: Option<i64>,
    pub filters: FilterPolicy,
    pub template: Template,
    pub vars: BTreeMap<String, String>,
    pub default_name: String,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub dry_run: bool,
    pub test_recipient: Option<String>,
}

impl Config {
    pub fn campaign_keys(&self) -> impl Iterator<Item = &str> {
        self.campaigns.keys().map(String::as_str)
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.app.db_timeout_secs)
    }

    /// Build the run plan for campaign `key`.
    pub fn plan(&self, key: &str, overrides: RunOverrides) -> Result<RunPlan, ConfigError> {
        let campaign = self
            .campaigns
            .get(key)
            .ok_or_else(|| invalid(format!("unknown campaign {key:?}")))?;
        let key = CampaignKey::parse(key)?;
        validate_campaign(&key, campaign)?;

        let batch_size = overrides
            .batch_size
            .or(campaign.batch_size)
            .unwrap_or(self.provider.batch_size);
        check_batch_size(batch_size, "batch_size")?;

        let test_recipient = match overrides.test_recipient {
            Some(id) if id.trim().is_empty() => {
                return Err(invalid("test recipient must be non-empty"))
            }
            Some(id) => Some(id.trim().to_string()),
            None => None,
        };

        let filters = FilterPolicy {
            validate_format: campaign.filters.validate_format,
            domain: campaign.filters.domain.clone(),
            exclude_sent_under: campaign.filters.exclude_sent_under.clone(),
            once_ever: campaign.filters.once_ever,
        };

        Ok(RunPlan {
            source: campaign.source.clone(),
            window: campaign.window,
            max_candidates: campaign.max_candidates.map(i64::from),
            filters,
            template: Template::parse(campaign.messages.clone())?,
            vars: campaign.vars.clone(),
            default_name: campaign
                .default_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_NAME.to_string()),
            batch_size,
            batch_delay: Duration::from_millis(
                campaign.batch_delay_ms.unwrap_or(self.provider.batch_delay_ms),
            ),
            dry_run: overrides.dry_run,
            test_recipient,
            key,
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn check_batch_size(size: usize, field: &str) -> Result<(), ConfigError> {
    if size == 0 || size > MAX_RECIPIENTS_PER_CALL {
        return Err(invalid(format!(
            "{field} must be between 1 and {MAX_RECIPIENTS_PER_CALL}, got {size}"
        )));
    }
    Ok(())
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.database_url.trim().is_empty() {
        return Err(invalid("app.database_url must be non-empty"));
    }
    if cfg.app.db_timeout_secs == 0 {
        return Err(invalid("app.db_timeout_secs must be > 0"));
    }

    if cfg.provider.channel_token.trim().is_empty() {
        return Err(invalid("provider.channel_token must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.provider.endpoint).is_err() {
        return Err(invalid("provider.endpoint must be an absolute URL"));
    }
    check_batch_size(cfg.provider.batch_size, "provider.batch_size")?;
    if cfg.provider.timeout_secs == 0 {
        return Err(invalid("provider.timeout_secs must be > 0"));
    }

    if cfg.campaigns.is_empty() {
        return Err(invalid("campaigns must define at least one campaign"));
    }
    for (name, campaign) in &cfg.campaigns {
        let key = CampaignKey::parse(name)?;
        validate_campaign(&key, campaign)?;
    }
    Ok(())
}

fn validate_campaign(key: &CampaignKey, c: &Campaign) -> Result<(), ConfigError> {
    c.window
        .validate()
        .map_err(|e| invalid(format!("campaigns.{key}: {e}")))?;

    if let Source::Purchases { statuses } = &c.source {
        if statuses.is_empty() {
            return Err(invalid(format!(
                "campaigns.{key}.source.statuses must list at least one status"
            )));
        }
    }
    if c.max_candidates == Some(0) {
        return Err(invalid(format!("campaigns.{key}.max_candidates must be > 0")));
    }
    if let Some(size) = c.batch_size {
        check_batch_size(size, &format!("campaigns.{key}.batch_size"))?;
    }

    match &c.filters.domain {
        Some(DomainExclusion::HoldsItem {
            item_code,
            statuses,
        }) => {
            if item_code.trim().is_empty() || statuses.is_empty() {
                return Err(invalid(format!(
                    "campaigns.{key}.filters.domain.holds_item needs item_code and statuses"
                )));
            }
        }
        Some(DomainExclusion::PurchasedWithin { days, statuses }) => {
            if *days == 0 || statuses.is_empty() {
                return Err(invalid(format!(
                    "campaigns.{key}.filters.domain.purchased_within needs days > 0 and statuses"
                )));
            }
            if *days > MAX_DAYS_AGO {
                return Err(invalid(format!(
                    "campaigns.{key}.filters.domain.purchased_within.days must be at most {MAX_DAYS_AGO}"
                )));
            }
        }
        None => {}
    }

    let template = Template::parse(c.messages.clone())?;
    if let Some(missing) = template
        .placeholders()
        .into_iter()
        .find(|p| !c.vars.contains_key(p) && !BUILTIN_VARS.contains(&p.as_str()))
    {
        return Err(invalid(format!(
            "campaigns.{key}.messages reference unknown placeholder {{{{{missing}}}}}"
        )));
    }
    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  database_url: "sqlite://./data/broadcast.db"
  db_timeout_secs: 10

provider:
  endpoint: "https://api.line.me/"
  channel_token: "YOUR_CHANNEL_ACCESS_TOKEN"
  batch_size: 500
  batch_delay_ms: 200
  timeout_secs: 15

campaigns:
  buyers_thanks_3d:
    source:
      kind: purchases
      statuses: [paid, shipped]
    window:
      start_days_ago: 4
      end_days_ago: 3
    filters:
      once_ever: false
    default_name: "Customer"
    messages:
      - type: text
        text: "Hi {{name}}, thank you for your order! Enjoy {{shop}}."
    vars:
      shop: "Tea Corner"

  follow_nudge_21d:
    source:
      kind: follows
    window:
      start_days_ago: 60
      end_days_ago: 21
    max_candidates: 5000
    filters:
      exclude_sent_under: [buyers_thanks_3d]
      domain:
        kind: holds_item
        item_code: "starter-kit"
        statuses: [paid, shipped]
    messages:
      - type: text
        text: "Still thinking about the starter kit? {{date}} only: free shipping."
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(
            cfg.campaign_keys().collect::<Vec<_>>(),
            vec!["buyers_thanks_3d", "follow_nudge_21d"]
        );
    }

    #[test]
    fn defaults_apply() {
        let cfg = example_cfg();
        let nudge = &cfg.campaigns["follow_nudge_21d"];
        assert!(nudge.filters.validate_format);
        assert!(nudge.filters.once_ever);
        assert!(!cfg.campaigns["buyers_thanks_3d"].filters.once_ever);
    }

    #[test]
    fn plan_uses_campaign_and_overrides() {
        let cfg = example_cfg();
        let plan = cfg.plan("buyers_thanks_3d", RunOverrides::default()).unwrap();
        assert_eq!(plan.key.as_str(), "buyers_thanks_3d");
        assert_eq!(plan.batch_size, 500);
        assert_eq!(plan.batch_delay, Duration::from_millis(200));
        assert!(!plan.filters.once_ever);
        assert_eq!(plan.default_name, "Customer");
        assert!(!plan.dry_run);

        let plan = cfg
            .plan(
                "follow_nudge_21d",
                RunOverrides {
                    dry_run: true,
                    test_recipient: Some(" U0123456789abcdef0123456789abcdef ".into()),
                    batch_size: Some(50),
                },
            )
            .unwrap();
        assert_eq!(plan.batch_size, 50);
        assert_eq!(plan.max_candidates, Some(5000));
        assert_eq!(
            plan.test_recipient.as_deref(),
            Some("U0123456789abcdef0123456789abcdef")
        );
        assert_eq!(plan.filters.exclude_sent_under.len(), 1);
    }

    #[test]
    fn plan_rejects_bad_overrides() {
        let cfg = example_cfg();
        let err = cfg.plan("nope", RunOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("unknown campaign")));

        let over = RunOverrides {
            batch_size: Some(501),
            ..RunOverrides::default()
        };
        assert!(matches!(
            cfg.plan("buyers_thanks_3d", over),
            Err(ConfigError::Invalid(_))
        ));

        let over = RunOverrides {
            test_recipient: Some("  ".into()),
            ..RunOverrides::default()
        };
        assert!(cfg.plan("buyers_thanks_3d", over).is_err());
    }

    #[test]
    fn invalid_window() {
        let mut cfg = example_cfg();
        cfg.campaigns.get_mut("buyers_thanks_3d").unwrap().window = Window {
            start_days_ago: 3,
            end_days_ago: 4,
        };
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("start_days_ago")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn day_offsets_are_bounded() {
        let mut cfg = example_cfg();
        cfg.campaigns.get_mut("follow_nudge_21d").unwrap().window = Window {
            start_days_ago: 200_000_000,
            end_days_ago: 0,
        };
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        assert!(cfg.plan("follow_nudge_21d", RunOverrides::default()).is_err());

        let mut cfg = example_cfg();
        cfg.campaigns.get_mut("follow_nudge_21d").unwrap().filters.domain =
            Some(DomainExclusion::PurchasedWithin {
                days: MAX_DAYS_AGO + 1,
                statuses: vec!["paid".into()],
            });
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("purchased_within.days")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_provider_settings() {
        let mut cfg = example_cfg();
        cfg.provider.channel_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("channel_token")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.provider.batch_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.provider.endpoint = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.provider.timeout_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_campaign_settings() {
        let mut cfg = example_cfg();
        cfg.campaigns.get_mut("buyers_thanks_3d").unwrap().source = Source::Purchases {
            statuses: vec![],
        };
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.campaigns.get_mut("buyers_thanks_3d").unwrap().messages = vec![];
        assert!(matches!(
            validate(&cfg),
            Err(ConfigError::Template(TemplateError::Empty))
        ));

        let mut cfg = example_cfg();
        cfg.campaigns.get_mut("buyers_thanks_3d").unwrap().vars.clear();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("{{shop}}")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.campaigns.get_mut("follow_nudge_21d").unwrap().filters.domain =
            Some(DomainExclusion::PurchasedWithin {
                days: 0,
                statuses: vec!["paid".into()],
            });
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        let c = cfg.campaigns.remove("follow_nudge_21d").unwrap();
        cfg.campaigns.insert("bad key".into(), c);
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.provider.batch_size, 500);
        assert_eq!(cfg.app.db_timeout_secs, 10);
    }

    #[test]
    fn load_reports_parse_errors() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, "app: [unclosed").unwrap();
        assert!(matches!(load(Some(&p)), Err(ConfigError::Parse(_))));
        assert!(matches!(
            load(Some(&td.path().join("missing.yaml"))),
            Err(ConfigError::Io(_))
        ));
    }
}
