mod config;
mod devops;
mod http;
mod report;
mod server;
mod store;
mod teams;

use rmcp::transport::stdio;
use rmcp::ServiceExt;
use server::DevOpsMcpServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Write structured logs to stderr so stdout stays clean for MCP JSON-RPC.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_env("RUST_LOG")
                .add_directive("azure_devops_mcp_server=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting azure-devops-mcp-server v{}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::from_env()?;
    let server = DevOpsMcpServer::new(config);

    let transport = stdio();

    tracing::info!("MCP server listening on stdio");

    let running = server.serve(transport).await?;
    running.waiting().await?;

    Ok(())
}
