//! UniSat open-API adapter: `{code, msg, data}` envelopes with titled fee tiers.

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::*;

pub const DEFAULT_BASE_URL: &str = "https://open-api.unisat.io";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct FeeSummaryData {
    list: Vec<FeeTier>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeTier {
    title: String,
    fee_rate: f64,
}

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    blocks: BlockHeight,
}

pub struct UnisatGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl UnisatGateway {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<T, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        let body = get_text(&self.client, &url, self.api_key.as_deref()).await?;
        unwrap_envelope(&body)
    }
}

#[async_trait]
impl ChainGateway for UnisatGateway {
    fn provider_id(&self) -> &str { "unisat" }

    async fn fee_summary(&self) -> Result<FeeSummary, UpstreamError> {
        let data: FeeSummaryData = self.fetch("/v5/default/fee-summary").await?;
        summary_from_tiers(&data.list)
    }

    async fn latest_block_height(&self) -> Result<BlockHeight, UpstreamError> {
        let info: BlockchainInfo = self.fetch("/v1/indexer/blockchain/info").await?;
        Ok(info.blocks)
    }
}

fn unwrap_envelope<T: DeserializeOwned>(body: &str) -> Result<T, UpstreamError> {
    let envelope: Envelope<T> = serde_json::from_str(body)?;
    if envelope.code != 0 {
        let msg = envelope.msg.unwrap_or_default();
        return Err(UpstreamError::new(
            UpstreamErrorKind::Rejected,
            if msg.trim().is_empty() { format!("upstream code {}", envelope.code) } else { msg },
        ));
    }
    envelope
        .data
        .ok_or_else(|| UpstreamError::malformed("response envelope has no data"))
}

fn summary_from_tiers(tiers: &[FeeTier]) -> Result<FeeSummary, UpstreamError> {
    let find = |names: &[&str]| -> Result<FeeRate, UpstreamError> {
        let tier = tiers
            .iter()
            .find(|t| names.iter().any(|n| t.title.eq_ignore_ascii_case(n)))
            .ok_or_else(|| UpstreamError::malformed(format!("fee summary missing tier {}", names[0])))?;
        whole_rate(tier.fee_rate)
    };

    Ok(FeeSummary {
        fast: find(&["fast"])?,
        medium: find(&["avg", "average", "medium"])?,
        slow: find(&["slow"])?,
        minimum: None,
        fetched_at: Utc::now(),
    })
}
