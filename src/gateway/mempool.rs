//! mempool.space adapter: recommended fees and plain-text tip height.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use super::*;

pub const DEFAULT_BASE_URL: &str = "https://mempool.space/api";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendedFees {
    fastest_fee: f64,
    half_hour_fee: f64,
    hour_fee: f64,
    #[serde(default)]
    minimum_fee: Option<f64>,
}

pub struct MempoolGateway {
    client: reqwest::Client,
    base_url: String,
}

impl MempoolGateway {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl ChainGateway for MempoolGateway {
    fn provider_id(&self) -> &str { "mempool" }

    async fn fee_summary(&self) -> Result<FeeSummary, UpstreamError> {
        let url = format!("{}/v1/fees/recommended", self.base_url);
        let body = get_text(&self.client, &url, None).await?;
        parse_fee_summary(&body)
    }

    async fn latest_block_height(&self) -> Result<BlockHeight, UpstreamError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let body = get_text(&self.client, &url, None).await?;
        parse_tip_height(&body)
    }
}

fn parse_fee_summary(body: &str) -> Result<FeeSummary, UpstreamError> {
    let fees: RecommendedFees = serde_json::from_str(body)?;
    Ok(FeeSummary {
        fast: whole_rate(fees.fastest_fee)?,
        medium: whole_rate(fees.half_hour_fee)?,
        slow: whole_rate(fees.hour_fee)?,
        minimum: fees.minimum_fee.map(whole_rate).transpose()?,
        fetched_at: Utc::now(),
    })
}

fn parse_tip_height(body: &str) -> Result<BlockHeight, UpstreamError> {
    body.trim()
        .parse::<BlockHeight>()
        .map_err(|e| UpstreamError::malformed(format!("tip height {:?}: {}", body.trim(), e)))
}
