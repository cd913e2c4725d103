//! 重定向 ID 传递
//!
//! 重定向响应的 `Location` 会带上 `mp-r-id` 参数，值为一路重定向经过的
//! 采样 ID 链（逗号分隔），目标页面据此一并展示之前请求的结果。

use http::HeaderMap;
use http::header::{HeaderValue, LOCATION};

/// 重定向 ID 参数名
pub const REDIRECT_PARAM: &str = "mp-r-id";

fn param_name(pair: &str) -> &str {
    pair.split('=').next().unwrap_or(pair)
}

/// 从当前请求的查询串中取出已有的重定向 ID 链
///
/// 保持原始编码，解码后的 `&`、`#` 会改变 Location 的结构
fn existing_chain(query_string: &str) -> Option<&str> {
    query_string.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == REDIRECT_PARAM && !value.is_empty()).then_some(value)
    })
}

/// 计算新的 ID 链：已有链在前，当前 ID 追加在后
pub fn request_id_chain(query_string: &str, request_id: &str) -> String {
    match existing_chain(query_string) {
        Some(chain) => format!("{},{}", chain, request_id),
        None => request_id.to_string(),
    }
}

/// 去掉 Location 中原有的 `mp-r-id`，再追加新的 ID 链
pub fn rewrite_location(location: &str, chain: &str) -> String {
    let (without_fragment, fragment) = match location.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (location, None),
    };
    let (base, query) = without_fragment
        .split_once('?')
        .unwrap_or((without_fragment, ""));

    let mut query = if query.is_empty() {
        String::new()
    } else {
        query
            .split('&')
            .filter(|pair| param_name(pair) != REDIRECT_PARAM)
            .collect::<Vec<_>>()
            .join("&")
    };
    if !query.is_empty() && !query.ends_with('&') {
        query.push('&');
    }
    query.push_str(REDIRECT_PARAM);
    query.push('=');
    query.push_str(chain);

    match fragment {
        Some(fragment) => format!("{}?{}#{}", base, query, fragment),
        None => format!("{}?{}", base, query),
    }
}

/// 改写响应头中的 `Location`，其余响应头保持不变
pub fn modify_redirect_headers(headers: &mut HeaderMap, query_string: &str, request_id: &str) {
    let chain = request_id_chain(query_string, request_id);

    let locations: Vec<HeaderValue> = headers
        .get_all(LOCATION)
        .iter()
        .map(|value| {
            let Ok(location) = value.to_str() else {
                return value.clone();
            };
            match HeaderValue::from_str(&rewrite_location(location, &chain)) {
                Ok(rewritten) => rewritten,
                Err(e) => {
                    tracing::warn!("改写重定向地址失败: {}", e);
                    value.clone()
                }
            }
        })
        .collect();

    if locations.is_empty() {
        return;
    }
    headers.remove(LOCATION);
    for location in locations {
        headers.append(LOCATION, location);
    }
}
