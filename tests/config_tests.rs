use std::io::Write;

use tempfile::NamedTempFile;

use vertex_trader::config::Config;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config file");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

#[test]
fn rejects_missing_credentials() {
    let file = write_config(
        r#"
[[venues]]
name = "test-venue-missing-creds"
kind = "binance_spot"
base_url = "https://api.example.com"
ws_url = "wss://ws.example.com"
"#,
    );

    let result = Config::load(file.path());
    assert!(result.is_err());
}

#[test]
fn loads_credentials_from_environment() {
    std::env::set_var("TEST_VENUE_LOADS_API_KEY", "key-123");
    std::env::set_var("TEST_VENUE_LOADS_API_SECRET", "secret-456");

    let file = write_config(
        r#"
[[venues]]
name = "test-venue-loads"
kind = "binance_spot"
base_url = "https://api.example.com"
ws_url = "wss://ws.example.com"
"#,
    );

    let config = Config::load(file.path()).expect("config should load with env credentials present");
    let venue = config.venue("test-venue-loads").expect("venue present");
    let keys = venue.keys().expect("credentials loaded");
    assert_eq!(keys.api_key, "key-123");
    assert_eq!(keys.secret, "secret-456");

    std::env::remove_var("TEST_VENUE_LOADS_API_KEY");
    std::env::remove_var("TEST_VENUE_LOADS_API_SECRET");
}

#[test]
fn rejects_empty_venue_list() {
    let file = write_config(
        r#"
venues = []
"#,
    );
    assert!(Config::load(file.path()).is_err());
}

#[test]
fn rejects_out_of_range_max_slippage() {
    std::env::set_var("TEST_VENUE_SLIPPAGE_API_KEY", "key");
    std::env::set_var("TEST_VENUE_SLIPPAGE_API_SECRET", "secret");

    let file = write_config(
        r#"
[[venues]]
name = "test-venue-slippage"
kind = "binance_spot"
base_url = "https://api.example.com"
ws_url = "wss://ws.example.com"

[rebalancer]
max_slippage = 1.5
"#,
    );

    assert!(Config::load(file.path()).is_err());

    std::env::remove_var("TEST_VENUE_SLIPPAGE_API_KEY");
    std::env::remove_var("TEST_VENUE_SLIPPAGE_API_SECRET");
}
