//! mascot-ask：向运行中的 mascot 发送一条 prompt 并打印回复
//!
//! 用法: mascot-ask [--addr 127.0.0.1:8770] [--health] 你好呀

use anyhow::Context;
use mascot::core::load_config_or_default;
use mascot::server::send_request;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = load_config_or_default(None);
    let mut addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let mut health = false;
    let mut words = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--addr" => addr = args.next().context("--addr needs a value")?,
            "--health" => health = true,
            _ => words.push(arg),
        }
    }

    let request = if health {
        "HEALTH".to_string()
    } else {
        let prompt = words.join(" ");
        if prompt.trim().is_empty() {
            anyhow::bail!("usage: mascot-ask [--addr host:port] [--health] <prompt>");
        }
        serde_json::json!({ "prompt": prompt }).to_string()
    };

    let response = send_request(&addr, &request)
        .await
        .with_context(|| format!("cannot reach mascot at {addr}"))?;

    match response.get("response").and_then(|v| v.as_str()) {
        Some(text) => println!("{text}"),
        None => println!("{}", serde_json::to_string_pretty(&response)?),
    }
    Ok(())
}
