//! Scenario configuration.

use serde::{Deserialize, Serialize};
use std::{env, time::Duration};
use uuid::Uuid;

/// Account the scenario registers and signs in with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

impl UserProfile {
    /// Fresh profile per run; re-registering an existing address fails at
    /// the portal, so every run gets a unique mailbox.
    pub fn random() -> Self {
        let tag = Uuid::new_v4().simple().to_string();
        Self {
            email: format!("user-{}@mesh.example", &tag[..8]),
            password: "MyPass1234".to_string(),
            first_name: "Firstname".to_string(),
            last_name: "Lastname".to_string(),
        }
    }
}

/// Runner-supplied scenario knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Portal root, trailing slash included.
    pub portal_base_url: String,
    /// Mail-capture inbox, relative to the portal root. Queried like any
    /// other web page.
    pub mail_inbox_path: String,
    /// Admin console login used by the activation fallback.
    pub admin_user: String,
    pub admin_password: String,
    /// Organization name override; a generated name is used when absent.
    pub org_name: Option<String>,
    pub user: UserProfile,
    /// Per-step wait bound.
    #[serde(with = "duration_millis")]
    pub step_timeout: Duration,
    /// Whole-scenario wall-clock budget.
    #[serde(with = "duration_millis")]
    pub overall_budget: Duration,
    /// Video capture toggle, passed through from the runner.
    pub video: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            portal_base_url: env::var("MESHPILOT_PORTAL_URL")
                .unwrap_or_else(|_| "https://portal.dev.local:8443/".to_string()),
            mail_inbox_path: "mailpit/".to_string(),
            admin_user: env::var("MESHPILOT_ADMIN_USER")
                .unwrap_or_else(|_| "keycloak-admin".to_string()),
            admin_password: env::var("MESHPILOT_ADMIN_PASSWORD")
                .unwrap_or_else(|_| "admin".to_string()),
            org_name: None,
            user: UserProfile::random(),
            step_timeout: Duration::from_secs(30),
            overall_budget: Duration::from_secs(90),
            video: env::var("VIDEO").map(|v| v == "true").unwrap_or(false),
        }
    }
}

impl ScenarioConfig {
    /// Absolute url below the portal root.
    pub fn portal_url(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.portal_base_url,
            path.trim_start_matches('/')
        )
    }

    pub fn mail_inbox_url(&self) -> String {
        self.portal_url(&self.mail_inbox_path)
    }

    pub fn organization_name(&self) -> String {
        self.org_name
            .clone()
            .unwrap_or_else(|| "mesh-demo-org".to_string())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_url_joins_paths() {
        let cfg = ScenarioConfig {
            portal_base_url: "https://portal.dev.local:8443/".into(),
            ..ScenarioConfig::default()
        };
        assert_eq!(
            cfg.portal_url("/mailpit/"),
            "https://portal.dev.local:8443/mailpit/"
        );
    }

    #[test]
    fn random_profiles_are_unique() {
        let a = UserProfile::random();
        let b = UserProfile::random();
        assert_ne!(a.email, b.email);
    }

    #[test]
    fn org_name_override_wins() {
        let mut cfg = ScenarioConfig::default();
        assert_eq!(cfg.organization_name(), "mesh-demo-org");
        cfg.org_name = Some("acme".into());
        assert_eq!(cfg.organization_name(), "acme");
    }
}
