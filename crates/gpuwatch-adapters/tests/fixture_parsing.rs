use std::fs;
use std::path::{Path, PathBuf};

use gpuwatch_adapters::providers::{coreweave, datacrunch, lambda_labs, runpod, vast_ai};
use gpuwatch_core::{AvailabilityStatus, PricingInstance};

fn fixture(provider: &str, file: &str) -> String {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(provider)
        .join(file);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

fn summary(items: &[PricingInstance]) -> Vec<(&str, &str, i32)> {
    items
        .iter()
        .map(|i| (i.instance_type.as_str(), i.gpu_slug.as_str(), i.gpu_count))
        .collect()
}

fn assert_prices_valid(items: &[PricingInstance]) {
    for item in items {
        assert!(item.price_per_hour.is_finite() && item.price_per_hour > 0.0);
        assert!(item.gpu_count > 0);
    }
}

#[test]
fn lambda_labs_fixture() {
    let items = lambda_labs::parse_instance_types(&fixture("lambda-labs", "instance_types.json"))
        .unwrap();
    assert_prices_valid(&items);
    assert_eq!(
        summary(&items),
        vec![
            ("gpu_1x_gh200", "gh200", 1),
            ("gpu_1x_h100_sxm5", "h100-sxm", 1),
            ("gpu_8x_a100_80gb_sxm4", "a100-80gb", 8),
        ]
    );
    assert_eq!(items[1].price_per_hour, 3.29);
    assert_eq!(items[1].regions, vec!["us-east-1", "us-west-3"]);
    assert_eq!(items[2].availability_status, AvailabilityStatus::Unavailable);
}

#[test]
fn runpod_fixture() {
    let body: serde_json::Value =
        serde_json::from_str(&fixture("runpod", "gpu_types.json")).unwrap();
    let items = runpod::parse_gpu_types(&body).unwrap();
    assert_prices_valid(&items);
    assert_eq!(
        summary(&items),
        vec![
            ("nvidia-h100-80gb-hbm3-secure", "h100-sxm", 1),
            ("nvidia-h100-80gb-hbm3-community", "h100-sxm", 1),
            ("nvidia-h100-pcie-secure", "h100-pcie", 1),
            ("nvidia-l40s-secure", "l40s", 1),
            ("nvidia-l40s-community", "l40s", 1),
        ]
    );
    assert_eq!(items[1].price_per_hour_spot, Some(1.55));
    assert_eq!(items[3].availability_status, AvailabilityStatus::Unknown);
}

#[test]
fn vast_ai_fixture() {
    let items = vast_ai::parse_offers(&fixture("vast-ai", "bundles.json")).unwrap();
    assert_prices_valid(&items);
    assert_eq!(
        summary(&items),
        vec![
            ("h100-sxm-1x", "h100-sxm", 1),
            ("h100-sxm-8x", "h100-sxm", 8),
            ("rtx-4090-1x", "rtx-4090", 1),
        ]
    );
    assert_eq!(items[0].price_per_hour, 1.98);
    assert_eq!(items[0].price_per_hour_spot, Some(1.2));
    assert_eq!(items[0].regions, vec!["Norway, NO", "US"]);
    assert_eq!(items[2].availability_status, AvailabilityStatus::Unavailable);
}

#[test]
fn coreweave_fixture() {
    let items = coreweave::parse_pricing_table(&fixture("coreweave", "pricing.html")).unwrap();
    assert_prices_valid(&items);
    assert_eq!(
        summary(&items),
        vec![
            ("nvidia-hgx-h100-8x", "h100-sxm", 8),
            ("nvidia-hgx-h200-8x", "h200", 8),
            ("nvidia-l40s-8x", "l40s", 8),
            ("nvidia-a100-40gb-pcie-1x", "a100-40gb", 1),
        ]
    );
    assert_eq!(items[3].price_per_hour, 2.39);
}

#[test]
fn datacrunch_fixture() {
    let items = datacrunch::parse_gpu_cards(&fixture("datacrunch", "products.html")).unwrap();
    assert_prices_valid(&items);
    assert_eq!(
        summary(&items),
        vec![
            ("h200-sxm5-141gb-8x", "h200", 8),
            ("h100-sxm5-80gb-1x", "h100-sxm", 1),
            ("rtx-6000-ada-48gb-1x", "rtx-6000-ada", 1),
        ]
    );
    assert_eq!(items[1].availability_status, AvailabilityStatus::Limited);
    assert_eq!(items[2].availability_status, AvailabilityStatus::Unavailable);
}
