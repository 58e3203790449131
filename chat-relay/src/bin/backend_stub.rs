// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Development backend answering chat messages with canned replies.

use anyhow::Context;
use tokio::net::TcpListener;

use chat_relay::backend_stub::{self, DEFAULT_STUB_ADDR};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chat_relay=info".parse()?),
        )
        .init();

    let addr = std::env::var("BACKEND_STUB_ADDR").unwrap_or_else(|_| DEFAULT_STUB_ADDR.to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind backend stub on {addr}"))?;

    tokio::select! {
        result = backend_stub::serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}
