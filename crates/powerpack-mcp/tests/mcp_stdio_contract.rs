use std::collections::BTreeSet;

fn first_text(resp: &rmcp::model::CallToolResult) -> String {
    resp.content
        .first()
        .and_then(|c| c.as_text())
        .map(|t| t.text.clone())
        .unwrap_or_default()
}

#[test]
fn stdio_lists_tools_and_serves_reports() {
    // Spawns the binary as a child process; skipped by default.
    if std::env::var("POWERPACK_E2E").ok().as_deref() != Some("1") {
        eprintln!("skipping: set POWERPACK_E2E=1 to run this test");
        return;
    }

    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    rt.block_on(async {
        use axum::{routing::post, Json, Router};
        use rmcp::{
            model::CallToolRequestParam,
            service::ServiceExt,
            transport::{ConfigureCommandExt, TokioChildProcess},
        };
        use std::net::SocketAddr;

        // Local Serper stand-in.
        let app = Router::new().route(
            "/search",
            post(|Json(body): Json<serde_json::Value>| async move {
                let q = body["q"].as_str().unwrap_or("").to_string();
                Json(serde_json::json!({
                    "organic": [
                        {"title": "Shared", "link": "https://shared.example/", "position": 1},
                        {"title": format!("Only {q}"), "link": format!("https://{q}.example/"), "position": 2}
                    ]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("axum serve");
        });

        let bin = assert_cmd::cargo::cargo_bin!("research-powerpack");
        let service = ()
            .serve(TokioChildProcess::new(
                tokio::process::Command::new(bin).configure(|cmd| {
                    cmd.args(["mcp-stdio"]);
                    for k in [
                        "REDDIT_CLIENT_ID",
                        "REDDIT_CLIENT_SECRET",
                        "SCRAPEDO_API_KEY",
                        "OPENROUTER_API_KEY",
                        "POWERPACK_ENV_FILE",
                    ] {
                        cmd.env_remove(k);
                    }
                    cmd.env("SERPER_API_KEY", "test-key");
                    cmd.env("POWERPACK_SERPER_ENDPOINT", format!("http://{addr}/search"));
                }),
            )?)
            .await?;

        let tools = service.list_tools(Default::default()).await?;
        let names: BTreeSet<String> = tools
            .tools
            .iter()
            .map(|t| t.name.clone().into_owned())
            .collect();
        for must_have in [
            "web_search",
            "search_reddit",
            "get_reddit_post",
            "scrape_links",
            "deep_research",
            "research_meta",
        ] {
            assert!(names.contains(must_have), "missing tool {must_have}");
        }

        let meta = service
            .call_tool(CallToolRequestParam {
                name: "research_meta".into(),
                arguments: None,
            })
            .await?;
        let md = first_text(&meta);
        assert!(md.starts_with("# research-powerpack status"), "{md}");
        assert!(!md.contains("test-key"));

        let resp = service
            .call_tool(CallToolRequestParam {
                name: "web_search".into(),
                arguments: serde_json::json!({"keywords": ["alpha", "beta"]})
                    .as_object()
                    .cloned(),
            })
            .await?;
        let md = first_text(&resp);
        assert!(md.contains("https://shared.example/"), "{md}");
        let v = resp.structured_content.clone().unwrap_or_default();
        assert_eq!(v["ok"].as_bool(), Some(true));
        assert_eq!(v["kind"].as_str(), Some("web_search"));

        // Not configured: Scrape.do key removed above.
        let resp = service
            .call_tool(CallToolRequestParam {
                name: "scrape_links".into(),
                arguments: serde_json::json!({"urls": ["https://example.com/"]})
                    .as_object()
                    .cloned(),
            })
            .await?;
        let v = resp.structured_content.clone().unwrap_or_default();
        assert_eq!(v["ok"].as_bool(), Some(false));
        assert_eq!(v["error"]["code"].as_str(), Some("not_configured"));

        service.cancel().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
    .expect("mcp stdio contract");
}
