#[test]
fn version_json_contract() {
    let bin = assert_cmd::cargo::cargo_bin!("research-powerpack");
    let out = std::process::Command::new(bin)
        .args(["version"])
        .output()
        .expect("run research-powerpack version");

    assert!(out.status.success(), "research-powerpack version failed");
    let s = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse version json");
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("version"));
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["name"].as_str(), Some("research-powerpack"));
    assert_eq!(v["version"].as_str(), Some(env!("CARGO_PKG_VERSION")));
}

#[test]
fn format_alias_is_accepted() {
    let bin = assert_cmd::cargo::cargo_bin!("research-powerpack");
    let out = std::process::Command::new(bin)
        .args(["version", "--format", "json"])
        .output()
        .expect("run research-powerpack version --format json");
    assert!(out.status.success());
    let v: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("parse version json");
    assert_eq!(v["kind"].as_str(), Some("version"));
}
