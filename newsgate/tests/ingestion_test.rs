use chrono::{Duration, TimeZone, Utc};
use common::{IngestionConfig, SourceConfig};
use newsgate::error::ProviderError;
use newsgate::ingestion::{
    collect_candidates, entries_to_candidates, fetch_feed, lookback_window, MAX_LOOKBACK_HOURS,
};
use newsgate::model::identity_key;
use newsgate::retry::RetryPolicy;

const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Wire</title>
    <link>https://wire.example</link>
    <description>Test feed</description>
    <item>
      <title>Central bank holds rates</title>
      <link>https://wire.example/rates?utm_source=rss</link>
      <description>&lt;p&gt;The bank &lt;b&gt;kept&lt;/b&gt; rates unchanged.&lt;/p&gt;</description>
      <pubDate>Thu, 15 Oct 2026 09:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Old story</title>
      <link>https://wire.example/old</link>
      <pubDate>Mon, 12 Oct 2026 09:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Undated story</title>
      <link>https://wire.example/undated</link>
    </item>
    <item>
      <title>No link at all</title>
      <description>Nothing to point at</description>
    </item>
  </channel>
</rss>"#;

fn source(url: String) -> SourceConfig {
    SourceConfig {
        name: "wire".to_string(),
        url,
        region: Some("eu".to_string()),
    }
}

#[test]
fn entries_are_filtered_by_lookback_and_link() {
    let feed = feed_rs::parser::parse(RSS.as_bytes()).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();

    let candidates = entries_to_candidates(
        &source("https://wire.example/rss".to_string()),
        feed.entries,
        Some(Duration::hours(6)),
        now,
    );

    let titles: Vec<&str> = candidates.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(titles, vec!["Central bank holds rates", "Undated story"]);

    let rates = &candidates[0];
    assert_eq!(rates.identity_key, identity_key("https://wire.example/rates"));
    assert_eq!(rates.region_tag.as_deref(), Some("eu"));
    assert!(rates.raw_summary.contains("kept"));
    assert!(!rates.raw_summary.contains("<p>"));
    assert!(rates.published_at.is_some());

    assert!(candidates[1].published_at.is_none());
}

#[test]
fn huge_lookback_is_clamped_and_keeps_dated_entries() {
    assert_eq!(lookback_window(6), Duration::hours(6));
    assert_eq!(lookback_window(u64::MAX), Duration::hours(MAX_LOOKBACK_HOURS as i64));
    assert_eq!(lookback_window(i64::MAX as u64 + 1), lookback_window(u64::MAX));

    let feed = feed_rs::parser::parse(RSS.as_bytes()).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();
    let candidates = entries_to_candidates(
        &source("https://wire.example/rss".to_string()),
        feed.entries,
        Some(lookback_window(u64::MAX)),
        now,
    );

    let titles: Vec<&str> = candidates.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(titles, vec!["Central bank holds rates", "Old story", "Undated story"]);
}

#[tokio::test]
async fn fetch_feed_maps_rate_limit() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/rss")
        .with_status(429)
        .create_async()
        .await;

    let client = reqwest::Client::new();
    let err = fetch_feed(&client, &format!("{}/rss", server.url()))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ProviderError>(),
        Some(ProviderError::RateLimited { .. })
    ));
}

#[tokio::test]
async fn failing_source_does_not_abort_collection() {
    let mut server = mockito::Server::new_async().await;
    let _ok = server
        .mock("GET", "/good")
        .with_status(200)
        .with_header("content-type", "application/rss+xml")
        .with_body(RSS)
        .create_async()
        .await;
    let _broken = server
        .mock("GET", "/broken")
        .with_status(500)
        .create_async()
        .await;

    let sources = vec![
        source(format!("{}/broken", server.url())),
        source(format!("{}/good", server.url())),
    ];
    // A wide lookback keeps the dated entries regardless of when the test runs.
    let settings = IngestionConfig {
        lookback_hours: Some(24 * 365 * 100),
        fetch_timeout_seconds: Some(5),
    };

    let candidates = collect_candidates(&sources, Some(&settings), &RetryPolicy::immediate(2))
        .await
        .unwrap();

    assert_eq!(candidates.len(), 3);
}
