//! プラン一覧の収集

use std::collections::HashSet;

use tracing::{debug, info, warn};
use url::Url;

use crate::config::ScraperConfig;
use crate::error::ScraperError;
use crate::layout::ListingLayout;
use crate::page::{open_with_retries, parse_selector, Snapshot};
use crate::traits::PageClient;

/// 一覧ページを開き、詳細ページURLを表示順に返す
///
/// 1件も見つからなければ `ListingEmpty`（サイト構造の変更を疑う）。
pub async fn collect_plan_urls<P: PageClient + ?Sized>(
    page: &mut P,
    config: &ScraperConfig,
) -> Result<Vec<String>, ScraperError> {
    info!("Collecting plan links from {}", config.listing_url);

    open_with_retries(
        page,
        &config.listing_url,
        config.navigation_retries,
        config.navigation_retry_delay,
    )
    .await?;

    if let Err(e) = page.wait_for_settled(config.settle_timeout).await {
        warn!("Listing page did not settle, reading anyway: {}", e);
    }

    let snapshot = page.snapshot().await?;
    let urls = plan_links(&snapshot, &config.layout.listing)?;

    if urls.is_empty() {
        return Err(ScraperError::ListingEmpty(format!(
            "{}: no links matched '{}'",
            config.listing_url, config.layout.listing.plan_link
        )));
    }

    info!("Found {} plan URLs", urls.len());
    Ok(urls)
}

/// 描画済み一覧からプランURLを抽出（絶対URL化・重複は最初を残す）
pub fn plan_links(snapshot: &Snapshot, layout: &ListingLayout) -> Result<Vec<String>, ScraperError> {
    let base = Url::parse(&snapshot.url)
        .map_err(|e| ScraperError::Navigation(format!("{}: {}", snapshot.url, e)))?;
    let selector = parse_selector(&layout.plan_link)?;
    let excluded: Vec<String> = layout
        .excluded_terms
        .iter()
        .map(|t| t.to_lowercase())
        .collect();

    let doc = snapshot.document();
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for anchor in doc.select(&selector) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            continue;
        }

        let Ok(mut url) = base.join(href) else {
            debug!("Unresolvable href: {}", href);
            continue;
        };
        url.set_query(None);
        url.set_fragment(None);

        if let Some(prefix) = &layout.path_prefix {
            let path = url.path();
            if !path.starts_with(prefix.as_str()) || path.trim_end_matches('/').len() < prefix.len() {
                continue;
            }
        }

        let lowered = url.as_str().to_lowercase();
        if let Some(term) = excluded.iter().find(|t| lowered.contains(t.as_str())) {
            debug!("Excluded '{}' ({})", url, term);
            continue;
        }

        let url = url.to_string();
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }

    Ok(urls)
}
