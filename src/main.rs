use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Router,
    body::Body,
    extract::{Query, State},
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use clap::Parser;
use futures::StreamExt;
use serde::Deserialize;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use mini_profiler::model::config::Config;
use mini_profiler::profiler::{
    MemoryStore, ProfilerLayer, ProfilerState, RequestContext, create_profiler_router,
    profiler_middleware,
};
use mini_profiler::rpc::TracedClient;

/// 过期采样结果的清理间隔
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "mini-profiler", version, about = "请求采样演示服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 采样层不加过滤，请求内的所有级别日志都能被捕获
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .with(ProfilerLayer::new())
        .init();

    let config_path = args
        .config
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let config = Config::load(&config_path)?;

    let store = Arc::new(MemoryStore::new(
        config.max_value_size,
        Some(config.store_ttl()),
    ));
    let state = ProfilerState::from_config(&config, store.clone());

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            store.cleanup_expired();
        }
    });

    let app = demo_router(TracedClient::default())
        .merge(create_profiler_router(state.clone()))
        .layer(middleware::from_fn_with_state(state, profiler_middleware));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("启动采样演示服务: http://{}", listener.local_addr()?);
    tracing::info!(
        "默认采样模式: {}，采样{}",
        config.default_mode,
        if config.enabled { "已启用" } else { "已关闭" }
    );

    axum::serve(listener, app).await?;
    Ok(())
}

fn demo_router(client: TracedClient) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream))
        .route("/redirect", get(redirect))
        .route("/fetch", get(fetch))
        .with_state(client)
}

async fn index(context: Option<Extension<RequestContext>>) -> String {
    tracing::info!("处理首页请求");
    match context {
        Some(Extension(context)) => format!("hello, request {} ({})", context.request_id, context.mode),
        None => "hello".to_string(),
    }
}

#[tracing::instrument]
fn render_chunk(index: usize) -> String {
    let checksum = (0..20_000u64).fold(index as u64, |acc, x| acc.wrapping_mul(31).wrapping_add(x));
    tracing::debug!(checksum, "生成分块");
    format!("chunk {index}: {checksum:x}\n")
}

async fn stream() -> Response {
    let chunks = futures::stream::iter(0..5).map(|i| Ok::<_, Infallible>(render_chunk(i)));
    Body::from_stream(chunks).into_response()
}

async fn redirect() -> Redirect {
    tracing::info!("跳转到首页");
    Redirect::to("/")
}

#[derive(Debug, Deserialize)]
struct FetchQuery {
    url: String,
}

async fn fetch(State(client): State<TracedClient>, Query(query): Query<FetchQuery>) -> String {
    match client.get(&query.url).await {
        Ok(response) => format!("{} -> {}", query.url, response.status()),
        Err(e) => {
            tracing::warn!("请求 {} 失败: {}", query.url, e);
            format!("{} -> error", query.url)
        }
    }
}
