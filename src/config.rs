use anyhow::{Context, Result};
use reqwest::Url;
use std::env;
use std::path::PathBuf;

use crate::http::Credentials;

/// Default location of the work-item snapshot written by `getazzureIssuesid`.
pub const DEFAULT_SNAPSHOT_PATH: &str = "src/data/azzureissues.json";
/// Default location of the rendered HTML work-item report.
pub const DEFAULT_REPORT_PATH: &str = "work_item_report.html";

/// Location of the Azure DevOps project the WIQL and work-item tools talk to.
///
/// Required environment variables:
/// - `AZURE_DEVOPS_ORG_URL`, e.g. `https://dev.azure.com/myorg`
/// - `AZURE_DEVOPS_PROJECT`: project name, e.g. `My Project`
#[derive(Debug, Clone)]
pub struct DevOpsConfig {
    pub org_url: String,
    pub project: String,
}

/// Top-level server configuration assembled from environment variables at startup.
///
/// Credentials are optional here; tools accept them as arguments and only
/// fall back to `AZURE_USERNAME` / `AZURE_PASSWORD` when they are omitted.
#[derive(Debug, Clone)]
pub struct Config {
    pub username: Option<String>,
    pub password: Option<String>,
    pub devops: Option<DevOpsConfig>,
    /// Incoming-webhook URL used by `postReportToTeams` (`TEAMS_WEBHOOK_URL`).
    pub teams_webhook_url: Option<String>,
    pub snapshot_path: PathBuf,
    pub report_path: PathBuf,
}

impl Config {
    /// Build configuration from the current process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// Returns an error only when `AZURE_DEVOPS_ORG_URL` is present but is not
    /// a valid URL; every other missing piece degrades to a tool-level error.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let username = var("AZURE_USERNAME");
        let password = var("AZURE_PASSWORD");
        if username.is_none() || password.is_none() {
            tracing::info!(
                "AZURE_USERNAME/AZURE_PASSWORD not fully set; tools will require \
                 credentials as arguments"
            );
        }

        let devops = match (var("AZURE_DEVOPS_ORG_URL"), var("AZURE_DEVOPS_PROJECT")) {
            (Some(org_url), Some(project)) => {
                Url::parse(&org_url)
                    .with_context(|| format!("AZURE_DEVOPS_ORG_URL is not a valid URL: {org_url}"))?;
                tracing::info!(%org_url, %project, "Azure DevOps project configured");
                Some(DevOpsConfig { org_url, project })
            }
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!(
                    "Only one of AZURE_DEVOPS_ORG_URL / AZURE_DEVOPS_PROJECT is set; \
                     work-item tools will return an error until both are configured"
                );
                None
            }
            (None, None) => None,
        };

        let teams_webhook_url = var("TEAMS_WEBHOOK_URL");
        if teams_webhook_url.is_none() {
            tracing::warn!("TEAMS_WEBHOOK_URL is not set; postReportToTeams will return an error");
        }

        Ok(Config {
            username,
            password,
            devops,
            teams_webhook_url,
            snapshot_path: var("ISSUES_SNAPSHOT_PATH")
                .unwrap_or_else(|| DEFAULT_SNAPSHOT_PATH.to_string())
                .into(),
            report_path: var("WORK_ITEM_REPORT_PATH")
                .unwrap_or_else(|| DEFAULT_REPORT_PATH.to_string())
                .into(),
        })
    }

    /// Convenience: return a reference to the Azure DevOps config or an error.
    pub fn require_devops(&self) -> Result<&DevOpsConfig> {
        self.devops.as_ref().context(
            "Azure DevOps is not configured (AZURE_DEVOPS_ORG_URL and AZURE_DEVOPS_PROJECT must be set)",
        )
    }

    /// Convenience: return the Teams webhook URL or an error.
    pub fn require_teams_webhook(&self) -> Result<&str> {
        self.teams_webhook_url
            .as_deref()
            .context("Teams webhook is not configured (TEAMS_WEBHOOK_URL not set)")
    }

    /// Resolve Basic-Auth credentials, preferring tool arguments over the environment.
    pub fn credentials(
        &self,
        username: Option<String>,
        secret: Option<String>,
    ) -> Result<Credentials> {
        let username = username
            .filter(|u| !u.is_empty())
            .or_else(|| self.username.clone())
            .context("No username supplied and AZURE_USERNAME is not set")?;
        let secret = secret
            .filter(|s| !s.is_empty())
            .or_else(|| self.password.clone())
            .context("No password/PAT supplied and AZURE_PASSWORD is not set")?;
        Ok(Credentials::new(username, secret))
    }
}
