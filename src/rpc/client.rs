//! 带调用追踪的 HTTP Client

use std::time::Instant;

use reqwest::{Client, IntoUrl, Request, Response};

use super::record_call;

/// 包装 reqwest::Client，每次请求完成后登记到当前作用域的记录器
#[derive(Debug, Clone, Default)]
pub struct TracedClient {
    client: Client,
}

impl TracedClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn execute(&self, request: Request) -> reqwest::Result<Response> {
        let service = request.url().host_str().unwrap_or("unknown").to_string();
        let method = format!("{} {}", request.method(), request.url().path());
        let started = Instant::now();

        let result = self.client.execute(request).await;
        match &result {
            Ok(response) => record_call(
                service,
                method,
                started,
                Some(response.status().as_u16()),
                None,
            ),
            Err(e) => record_call(service, method, started, None, Some(e.to_string())),
        }
        result
    }

    pub async fn get<U: IntoUrl>(&self, url: U) -> reqwest::Result<Response> {
        let request = self.client.get(url).build()?;
        self.execute(request).await
    }
}
