const SECRET_KEYS: [&str; 6] = [
    "SERPER_API_KEY",
    "REDDIT_CLIENT_ID",
    "REDDIT_CLIENT_SECRET",
    "SCRAPEDO_API_KEY",
    "OPENROUTER_API_KEY",
    "POWERPACK_ENV_FILE",
];

fn doctor(extra_env: &[(&str, &str)]) -> serde_json::Value {
    let bin = assert_cmd::cargo::cargo_bin!("research-powerpack");
    let mut cmd = std::process::Command::new(bin);
    cmd.args(["doctor", "--check-stdio=false", "--timeout-ms", "1"]);
    // Never inherit real keys from the developer's shell.
    for k in SECRET_KEYS {
        cmd.env_remove(k);
    }
    for (k, v) in extra_env {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run research-powerpack doctor");
    assert!(out.status.success(), "research-powerpack doctor failed");
    let s = String::from_utf8_lossy(&out.stdout);
    serde_json::from_str(&s).expect("parse doctor json")
}

#[test]
fn doctor_contract_json_and_bool_flags() {
    let v = doctor(&[]);

    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("doctor"));
    assert_eq!(v["name"].as_str(), Some("research-powerpack"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());
    assert!(v.get("elapsed_ms").is_some());
    assert_eq!(v["features"]["stdio"].as_bool(), Some(cfg!(feature = "stdio")));

    for cap in ["search", "reddit", "scraping", "llm"] {
        assert_eq!(v["configured"][cap].as_bool(), Some(false), "{cap}");
    }
    assert_eq!(v["enabled_tools"].as_array().map(|a| a.len()), Some(0));
    assert_eq!(v["missing_env"].as_array().map(|a| a.len()), Some(5));

    let checks = v["checks"].as_array().expect("checks array");
    let handshake = checks
        .iter()
        .find(|c| c["name"].as_str() == Some("mcp_stdio_handshake"))
        .expect("mcp_stdio_handshake check");
    assert_eq!(handshake["skipped"].as_bool(), Some(true));
    assert_eq!(handshake["ok"].as_bool(), Some(true));
    assert!(handshake.get("elapsed_ms").is_some());
    assert!(handshake.get("error").is_some());
    assert_eq!(v["ok"].as_bool(), Some(true));
}

#[test]
fn doctor_reports_booleans_not_secret_values() {
    let v = doctor(&[
        ("SERPER_API_KEY", "serper-secret-123"),
        ("OPENROUTER_API_KEY", "sk-or-secret-456"),
    ]);
    assert_eq!(v["configured"]["search"].as_bool(), Some(true));
    assert_eq!(v["configured"]["llm"].as_bool(), Some(true));
    assert_eq!(v["configured"]["reddit"].as_bool(), Some(false));

    let tools: Vec<&str> = v["enabled_tools"]
        .as_array()
        .expect("enabled_tools")
        .iter()
        .filter_map(|t| t.as_str())
        .collect();
    assert_eq!(tools, ["web_search", "search_reddit", "deep_research"]);

    let raw = v.to_string();
    assert!(!raw.contains("serper-secret-123"));
    assert!(!raw.contains("sk-or-secret-456"));
}

#[test]
fn doctor_reads_env_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("powerpack.env");
    std::fs::write(&path, "# keys\nSCRAPEDO_API_KEY=\"from-file\"\n").expect("write env file");
    let p = path.to_string_lossy().to_string();

    let v = doctor(&[("POWERPACK_ENV_FILE", &p)]);
    assert_eq!(v["configured"]["scraping"].as_bool(), Some(true));
    let checks = v["checks"].as_array().expect("checks array");
    let env_check = checks
        .iter()
        .find(|c| c["name"].as_str() == Some("env_file_readable"))
        .expect("env_file_readable check");
    assert_eq!(env_check["ok"].as_bool(), Some(true));
}

#[test]
fn doctor_flags_missing_env_file() {
    let v = doctor(&[("POWERPACK_ENV_FILE", "/nonexistent/powerpack.env")]);
    assert_eq!(v["ok"].as_bool(), Some(false));
    let checks = v["checks"].as_array().expect("checks array");
    assert!(checks
        .iter()
        .any(|c| c["name"].as_str() == Some("env_file_readable") && c["ok"] == false));
}
