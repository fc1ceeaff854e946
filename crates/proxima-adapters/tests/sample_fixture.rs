// The shipped sample fixture must stay decodable and keep its period numbering.

use proxima_adapters::decode_planets;
use proxima_core::normalize_all;

#[test]
fn sample_fixture_normalizes_to_known_periods() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let body = std::fs::read(root.join("fixtures/proxima_sample.json")).expect("fixture");
    let planets = decode_planets("fixture", &body).expect("decode");
    let periods = normalize_all(&planets)
        .into_iter()
        .map(|o| o.period_number)
        .collect::<Vec<_>>();
    assert_eq!(periods, vec![10, 10, 10, 9, 9]);
}
