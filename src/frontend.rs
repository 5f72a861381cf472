//! 内嵌的浏览器界面资源。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::debug;

use crate::config::ROUTE_PREFIX;
use crate::error::ApiError;

/// 按相对名称提供静态资源。
pub trait AssetProvider: Send + Sync {
    fn get(&self, name: &str) -> Option<Cow<'static, [u8]>>;
}

#[derive(RustEmbed)]
#[folder = "static"]
struct StaticAssets;

/// 编译进二进制的界面资源。
pub struct EmbeddedAssets;

impl AssetProvider for EmbeddedAssets {
    fn get(&self, name: &str) -> Option<Cow<'static, [u8]>> {
        StaticAssets::get(name).map(|file| file.data)
    }
}

/// 未匹配 API 路由的请求回退到这里。
pub async fn serve_frontend(
    Extension(assets): Extension<Arc<dyn AssetProvider>>,
    req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    let Some(name) = asset_name(path) else {
        debug!(path, "no frontend asset");
        return Err(ApiError::NotFound("not found".into()));
    };
    load_asset(assets.as_ref(), name)?.ok_or_else(|| ApiError::NotFound("not found".into()))
}

/// 把请求路径映射为资源名；带兼容前缀的路径等同于不带前缀。
fn asset_name(path: &str) -> Option<&str> {
    let path = match path.strip_prefix(ROUTE_PREFIX) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => path,
    };
    let name = path.trim_start_matches('/');
    if name.is_empty() || name == "index.html" {
        return Some("index.html");
    }
    if name.split('/').any(|segment| segment == ".." || segment.is_empty()) {
        return None;
    }
    let name = name.strip_prefix("static/").unwrap_or(name);
    (name.starts_with("css/") || name.starts_with("js/")).then_some(name)
}

fn load_asset(assets: &dyn AssetProvider, name: &str) -> Result<Option<Response>, ApiError> {
    let Some(data) = assets.get(name) else {
        return Ok(None);
    };
    let mime = mime_guess::from_path(name).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    Ok(Some(
        (headers, AxumBody::from(data.into_owned())).into_response(),
    ))
}
