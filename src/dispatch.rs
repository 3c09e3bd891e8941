//! Request dispatcher: GET/POST/OPTIONS semantics on top of the admission
//! layer.
//!
//! GET serves files from the resource root through the path resolver;
//! POST accepts small JSON documents into `uploads/`; OPTIONS advertises
//! the method surface. Everything else was already answered with 405
//! before dispatch.

use crate::{
    errors::Reject,
    guard,
    http::{
        request::Request,
        response::Response,
        types::{Method, StatusCode, ALLOWED_METHODS},
    },
    limits::SiteConfig,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::{io, path::Path};
use tokio::io::AsyncReadExt;
use tracing::warn;

/// File reads accumulate in slices of this size.
const FILE_READ_CHUNK: usize = 8192;

/// Soft cap on a served file. Larger files are refused instead of
/// truncated.
const FILE_SOFT_CAP: u64 = 10 * 1024 * 1024;

pub(crate) async fn dispatch(req: &Request, site: &SiteConfig) -> Result<Response, Reject> {
    match req.method() {
        Method::Get => get_resource(req, site).await,
        Method::Post => match req.path() {
            "/upload" => post_upload(req, site).await,
            _ => Err(Reject::NotFound),
        },
        Method::Options => Ok(Response::new(StatusCode::NoContent).header("Allow", ALLOWED_METHODS)),
        Method::Other(_) => Err(Reject::MethodNotAllowed),
    }
}

// GET

async fn get_resource(req: &Request, site: &SiteConfig) -> Result<Response, Reject> {
    let file = match req.path() {
        "/" | "" => site.index_file(),
        path => guard::path::resolve(path, site).await?,
    };

    let (content_type, attachment) = content_type_for(&file, site)?;
    let body = read_file(&file).await?;

    let mut resp = Response::new(StatusCode::Ok)
        .content_type(content_type)
        .body(body);
    if attachment {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download");
        resp = resp.header("Content-Disposition", format!("attachment; filename=\"{name}\""));
    }
    Ok(resp)
}

/// Content type and disposition by extension. Unknown extensions are not
/// served at all.
fn content_type_for<'a>(file: &Path, site: &'a SiteConfig) -> Result<(&'a str, bool), Reject> {
    let extension = file
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let entry = match extension.as_str() {
        "html" => ("text/html; charset=utf-8", false),
        "json" => ("application/json; charset=utf-8", false),
        "png" | "jpg" | "jpeg" | "gif" | "txt" => ("application/octet-stream", true),
        "pdf" => ("application/pdf", false),
        other => match site.extra_content_type(other) {
            Some(content_type) => (content_type, false),
            None => return Err(Reject::UnsupportedMediaType),
        },
    };
    Ok(entry)
}

async fn read_file(path: &Path) -> Result<Vec<u8>, Reject> {
    let mut file = tokio::fs::File::open(path).await.map_err(map_fs_error)?;
    let meta = file.metadata().await.map_err(map_fs_error)?;
    if meta.is_dir() {
        return Err(Reject::NotFound);
    }
    if meta.len() > FILE_SOFT_CAP {
        warn!(size = meta.len(), cap = FILE_SOFT_CAP, "refusing oversized file");
        return Err(Reject::Internal);
    }

    let mut body = Vec::with_capacity(meta.len() as usize);
    let mut chunk = [0u8; FILE_READ_CHUNK];
    loop {
        match file.read(&mut chunk).await.map_err(map_fs_error)? {
            0 => break,
            n => body.extend_from_slice(&chunk[..n]),
        }
    }
    Ok(body)
}

fn map_fs_error(e: io::Error) -> Reject {
    match e.kind() {
        io::ErrorKind::NotFound => Reject::NotFound,
        io::ErrorKind::PermissionDenied => Reject::Forbidden("unreadable path"),
        _ => Reject::Internal,
    }
}

// POST /upload

#[derive(Serialize)]
struct UploadReceipt {
    status: &'static str,
    filepath: String,
    size: usize,
    received_at: String,
}

async fn post_upload(req: &Request, site: &SiteConfig) -> Result<Response, Reject> {
    if !is_json_content_type(req.header("content-type")) {
        return Err(Reject::UnsupportedMediaType);
    }

    let document: serde_json::Value =
        serde_json::from_slice(req.body()).map_err(|_| Reject::BadRequest("malformed JSON"))?;
    let normalized = serde_json::to_vec(&document).map_err(|_| Reject::Internal)?;

    let name = format!(
        "upload_{}_{}.json",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        random_suffix()
    );

    // Temp-file-plus-rename keeps partially written uploads unobservable.
    let temp = site.upload_dir.join(format!(".{name}.tmp"));
    let target = site.upload_dir.join(&name);
    tokio::fs::write(&temp, &normalized)
        .await
        .map_err(|_| Reject::Internal)?;
    if let Err(_e) = tokio::fs::rename(&temp, &target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(Reject::Internal);
    }

    let receipt = UploadReceipt {
        status: "created",
        filepath: format!("/uploads/{name}"),
        size: normalized.len(),
        received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    let body = serde_json::to_vec(&receipt).map_err(|_| Reject::Internal)?;

    Ok(Response::new(StatusCode::Created)
        .content_type("application/json")
        .body(body))
}

/// `application/json`, parameters tolerated (`; charset=utf-8`).
fn is_json_content_type(value: Option<&str>) -> bool {
    match value {
        Some(value) => value
            .split(';')
            .next()
            .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json")),
        None => false,
    }
}

fn random_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}
