//! Service-instance export: every source-control binding on a live toolchain,
//! enriched with creator and organization names.

use crate::error::AccessError;
use crate::sync::event_log::EventLog;
use crate::sync::model::{ToolchainId, ToolchainRecord};
use crate::sync::scanner::{ViewQuery, scan};
use crate::sync::store::Store;
use crate::sync::warehouse::Warehouse;
use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

pub const TRACEABILITY_NOT_FOUND: &str = "traceability not found";
pub const UNKNOWN_ORG_NAME: &str = "Unknown OrgId";
pub const UNKNOWN_USER_NAME: &str = "Unknown userId";
const ALL_DOCS: &str = "_all_docs";
const TEST_MAIL_DOMAIN: &str = "mailinator.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_name: String,
    pub email: Option<String>,
}

/// Users and organizations by id, as recorded in the users database.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: BTreeMap<String, UserProfile>,
    orgs: BTreeMap<String, String>,
}

impl UserDirectory {
    pub fn load<S: Store + ?Sized>(store: &S, batch: usize) -> Result<Self, AccessError> {
        let mut directory = Self::default();
        for row in scan(store, ViewQuery::new(ALL_DOCS, batch).with_docs())? {
            if let Some(doc) = row?.doc {
                directory.absorb(&doc);
            }
        }
        tracing::info!(
            users = directory.users.len(),
            orgs = directory.orgs.len(),
            "loaded user directory"
        );
        Ok(directory)
    }

    /// Adds one user document. The first document seen for an id wins.
    pub fn absorb(&mut self, doc: &Value) {
        let Some(record) = doc.get("user_record") else {
            return;
        };
        let profile = record.get("profile");
        let user_id = profile.and_then(|p| p.get("user_id")).and_then(Value::as_str);
        let user_name = profile.and_then(|p| p.get("user_name")).and_then(Value::as_str);
        if let (Some(user_id), Some(user_name)) = (user_id, user_name) {
            self.users
                .entry(user_id.to_string())
                .or_insert_with(|| UserProfile {
                    user_name: user_name.to_string(),
                    email: profile
                        .and_then(|p| p.get("email"))
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned),
                });
        }
        for org in record
            .get("organizations")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let (Some(guid), Some(name)) = (
                org.get("guid").and_then(Value::as_str),
                org.get("name").and_then(Value::as_str),
            ) {
                self.orgs
                    .entry(guid.to_string())
                    .or_insert_with(|| name.to_string());
            }
        }
    }

    pub fn user(&self, user_id: &str) -> Option<&UserProfile> {
        self.users.get(user_id)
    }

    pub fn org_name(&self, org_guid: &str) -> Option<&str> {
        self.orgs.get(org_guid).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InternalUser {
    #[serde(rename = "true")]
    Yes,
    #[serde(rename = "false")]
    No,
    #[serde(rename = "unknown")]
    Unknown,
}

fn mail_domain(address: &str) -> Option<&str> {
    let mut parts = address.split('@');
    let (_, domain) = (parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    Some(domain)
}

pub fn classify_user(profile: Option<&UserProfile>) -> InternalUser {
    let Some(profile) = profile else {
        return InternalUser::Unknown;
    };
    if profile.user_name.to_lowercase().contains("ibm") {
        return InternalUser::Yes;
    }
    let test_account = [Some(profile.user_name.as_str()), profile.email.as_deref()]
        .into_iter()
        .flatten()
        .filter_map(mail_domain)
        .any(|domain| domain.eq_ignore_ascii_case(TEST_MAIL_DOMAIN));
    if test_account {
        InternalUser::Yes
    } else {
        InternalUser::No
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInstanceRow {
    pub creation_date: String,
    pub toolchain_guid: String,
    pub organization_guid: String,
    pub organization_name: String,
    pub creator: String,
    pub creator_name: String,
    pub service_id: String,
    pub instance_id: String,
    pub webhook_id: String,
    pub enable_traceability: String,
    pub ibm: InternalUser,
    pub recent_activity: bool,
}

impl ServiceInstanceRow {
    pub fn needs_webhook(&self) -> bool {
        self.webhook_id == crate::sync::model::WEBHOOK_NOT_SET
    }
}

pub fn build_rows(
    records: &[ToolchainRecord],
    service_kinds: &[String],
    directory: &UserDirectory,
    active: &BTreeSet<ToolchainId>,
) -> Vec<ServiceInstanceRow> {
    let mut rows = Vec::new();
    for record in records.iter().filter(|r| !r.deleted) {
        let organization_guid = record.organization_guid.clone().unwrap_or_default();
        let creator = record.creator.clone().unwrap_or_default();
        let profile = directory.user(&creator);
        let recent_activity = ToolchainId::parse(&record.toolchain_guid)
            .is_some_and(|id| active.contains(&id));
        for binding in &record.services {
            if !service_kinds.iter().any(|kind| kind == &binding.service_id) {
                continue;
            }
            let mut binding = binding.clone();
            binding.normalize();
            rows.push(ServiceInstanceRow {
                creation_date: record
                    .created
                    .as_deref()
                    .map(|created| created.chars().take(10).collect())
                    .unwrap_or_default(),
                toolchain_guid: record.toolchain_guid.clone(),
                organization_name: directory
                    .org_name(&organization_guid)
                    .unwrap_or(UNKNOWN_ORG_NAME)
                    .trim()
                    .to_string(),
                organization_guid: organization_guid.clone(),
                creator: creator.clone(),
                creator_name: profile
                    .map_or(UNKNOWN_USER_NAME, |p| p.user_name.as_str())
                    .trim()
                    .to_string(),
                service_id: binding.service_id.clone(),
                instance_id: binding.instance_id.clone().unwrap_or_default(),
                webhook_id: binding.webhook_id.clone(),
                enable_traceability: binding
                    .enable_traceability
                    .map_or_else(|| TRACEABILITY_NOT_FOUND.to_string(), |on| on.to_string()),
                ibm: classify_user(profile),
                recent_activity,
            });
        }
    }
    rows
}

pub fn write_csv(path: &Path, rows: &[ServiceInstanceRow]) -> Result<usize> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(rows.len())
}

/// Writes `{"toolchainsToFix": [...]}` with the rows that have no webhook.
pub fn write_json(path: &Path, rows: &[ServiceInstanceRow]) -> Result<usize> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let to_fix: Vec<&ServiceInstanceRow> = rows.iter().filter(|row| row.needs_webhook()).collect();
    let body = serde_json::to_string_pretty(&json!({ "toolchainsToFix": to_fix }))?;
    fs::write(path, format!("{body}\n"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(to_fix.len())
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportOutcome {
    pub toolchains: usize,
    pub rows: usize,
    pub to_fix: usize,
    pub csv_path: Option<PathBuf>,
    pub json_path: Option<PathBuf>,
}

/// Loads live records and the activity set alongside the user directory,
/// then writes whichever outputs were requested.
pub fn export<W: Store, E: Store, U: Store>(
    warehouse: &Warehouse<W>,
    events: &EventLog<E>,
    users: &U,
    user_batch: usize,
    service_kinds: &[String],
    csv_path: Option<&Path>,
    json_path: Option<&Path>,
) -> Result<ExportOutcome> {
    let (instances, directory) = thread::scope(|scope| {
        let instances = scope.spawn(|| -> Result<_, AccessError> {
            Ok((warehouse.live_records()?, events.active_toolchains()?))
        });
        let directory = scope.spawn(|| UserDirectory::load(users, user_batch));
        let instances = instances
            .join()
            .map_err(|_| anyhow!("warehouse scan panicked"))?
            .context("warehouse scan for export failed")?;
        let directory = directory
            .join()
            .map_err(|_| anyhow!("user directory scan panicked"))?
            .context("user directory scan failed")?;
        Ok::<_, anyhow::Error>((instances, directory))
    })?;
    let (records, active) = instances;

    let rows = build_rows(&records, service_kinds, &directory, &active);
    let to_fix = rows.iter().filter(|row| row.needs_webhook()).count();
    if let Some(path) = csv_path {
        write_csv(path, &rows)?;
    }
    if let Some(path) = json_path {
        write_json(path, &rows)?;
    }
    tracing::info!(
        toolchains = records.len(),
        rows = rows.len(),
        to_fix,
        "service instance export finished"
    );
    Ok(ExportOutcome {
        toolchains: records.len(),
        rows: rows.len(),
        to_fix,
        csv_path: csv_path.map(Path::to_path_buf),
        json_path: json_path.map(Path::to_path_buf),
    })
}
