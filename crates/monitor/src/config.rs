use std::path::Path;

use anyhow::Context;

use watchtower_core::endpoint::Endpoint;

/// Load endpoint definitions from a JSON file (an array of endpoints).
///
/// Definitions are normalized but not validated here; the engine rejects
/// malformed endpoints at registration.
pub fn load_endpoints(path: &Path) -> anyhow::Result<Vec<Endpoint>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read endpoints file {}", path.display()))?;
    let mut endpoints: Vec<Endpoint> =
        serde_json::from_str(&raw).context("failed to parse endpoints file")?;
    for endpoint in &mut endpoints {
        endpoint.normalize();
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn parses_a_minimal_endpoints_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"[
                {{
                    "id": "home",
                    "name": " Home Page ",
                    "url": "https://example.com/",
                    "headers": {{ "X-Probe": "watchtower" }}
                }}
            ]"#
        )
        .expect("write temp file");

        let endpoints = load_endpoints(file.path()).expect("load");
        assert_eq!(endpoints.len(), 1);
        let ep = &endpoints[0];
        assert_eq!(ep.id, "home");
        // Normalization trimmed the name and lowercased header keys.
        assert_eq!(ep.name, "Home Page");
        assert_eq!(ep.headers.get("x-probe").map(String::as_str), Some("watchtower"));
        // Serde defaults fill the unspecified knobs.
        assert_eq!(ep.expected_status, 200);
        assert_eq!(ep.interval_secs, 60);
        assert!(ep.enabled);
    }

    #[test]
    fn missing_and_malformed_files_are_reported_with_context() {
        let err = load_endpoints(Path::new("/nonexistent/endpoints.json"))
            .expect_err("missing file");
        assert!(err.to_string().contains("endpoints file"));

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "not json").expect("write temp file");
        assert!(load_endpoints(file.path()).is_err());
    }
}
