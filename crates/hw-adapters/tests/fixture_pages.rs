use std::path::PathBuf;

use hw_adapters::{derive_identity, FixtureListingSource, ListingSource, PageFormat};
use hw_core::{normalize, ListingStatus};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/pages")
}

#[tokio::test]
async fn json_fixture_page_normalizes_all_but_the_malformed_record() {
    let source = FixtureListingSource::new(fixtures_dir());
    let page = source.take(1).await.expect("page 1 fixture");
    assert_eq!(page.format, PageFormat::Json);
    assert_eq!(page.records.len(), 5);

    let results: Vec<_> = page.records.iter().map(normalize).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
    assert!(results[2].is_err());
}

#[tokio::test]
async fn html_fixture_page_yields_scrape_time_identities() {
    let source = FixtureListingSource::new(fixtures_dir());
    let page = source.take(2).await.expect("page 2 fixture");
    assert_eq!(page.format, PageFormat::Html);

    let listings: Vec<_> = page
        .records
        .iter()
        .map(|r| normalize(r).expect("html rows are well formed"))
        .collect();
    assert_eq!(listings.len(), 2);
    assert_eq!(
        listings[0].identity,
        derive_identity("Gaoxin", "Tianfu Heights", "2026-0112")
    );
    assert_eq!(listings[0].number, 318);
    assert_eq!(listings[1].status, ListingStatus::Sold);
}
