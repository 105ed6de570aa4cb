use crate::error::AccessError;
use crate::sync::model::{ToolchainId, ToolchainRecord};
use crate::sync::source::{SourceOfTruth, index_ids_from_store};
use crate::sync::store::Store;
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
struct ToolchainList {
    #[serde(default)]
    items: Vec<Value>,
}

/// Toolchain API client. Lookups go over HTTP; the id index is read from the
/// API's own toolchains database.
pub struct OtcSource<I> {
    client: Client,
    base_url: Url,
    token: Option<String>,
    index: I,
    index_batch: usize,
}

impl<I: Store> OtcSource<I> {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout_secs: u64,
        index: I,
        index_batch: usize,
    ) -> Result<Self, AccessError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| AccessError::InvalidQuery(format!("invalid otc base url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AccessError::InvalidQuery(format!(
                "otc base url {base_url} cannot carry a path"
            )));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            token: token.filter(|t| !t.trim().is_empty()),
            index,
            index_batch,
        })
    }

    fn toolchain_url(&self, id: &ToolchainId) -> Result<Url, AccessError> {
        toolchain_url(&self.base_url, id)
    }
}

pub fn toolchain_url(base: &Url, id: &ToolchainId) -> Result<Url, AccessError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| {
            AccessError::InvalidQuery(format!("otc base url {base} cannot carry a path"))
        })?
        .pop_if_empty()
        .extend(["api", "v1", "toolchains", id.as_str()]);
    Ok(url)
}

/// The first listed toolchain, or `None` for an empty list.
pub fn parse_lookup(id: &ToolchainId, body: &str) -> Result<Option<ToolchainRecord>, AccessError> {
    let list: ToolchainList = serde_json::from_str(body)?;
    list.items
        .into_iter()
        .next()
        .map(|raw| ToolchainRecord::from_source(id, raw))
        .transpose()
}

impl<I: Store> SourceOfTruth for OtcSource<I> {
    fn get_toolchain(&self, id: &ToolchainId) -> Result<Option<ToolchainRecord>, AccessError> {
        let mut request = self.client.get(self.toolchain_url(id)?);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send()?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.text()?;
        if !status.is_success() {
            return Err(AccessError::Transient(format!(
                "toolchain lookup {id}: HTTP {} {}",
                status.as_u16(),
                crate::sync::util::truncate_with_ellipsis(body.trim(), 200)
            )));
        }
        parse_lookup(id, &body)
    }

    fn index_ids(&self) -> Result<BTreeSet<ToolchainId>, AccessError> {
        index_ids_from_store(&self.index, self.index_batch)
    }
}
