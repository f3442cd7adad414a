use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Method, StatusCode};

use super::{BlobStore, StorageError};

/// Blob store backed by a WebDAV collection. Rename maps to MOVE with
/// `Overwrite: F`, which RFC 4918 requires to be atomic, so the queue
/// protocol holds on any compliant server.
#[derive(Clone)]
pub struct WebdavStore {
    base: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl WebdavStore {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        proxy: Option<&str>,
    ) -> Result<Self, StorageError> {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(15));
        if let Some(url) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(url)?);
        }
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client: builder.build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.base.clone()
        } else {
            format!("{}/{}", self.base, path)
        }
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    fn unexpected(&self, status: StatusCode, path: &str) -> StorageError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageError::Auth,
            _ => StorageError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            },
        }
    }
}

fn dav_method(name: &'static str) -> Result<Method, StorageError> {
    Method::from_bytes(name.as_bytes())
        .map_err(|_| StorageError::Protocol(format!("invalid method {name}")))
}

#[async_trait]
impl BlobStore for WebdavStore {
    async fn put(&self, path: &str, body: &[u8]) -> Result<(), StorageError> {
        let url = self.url(path);
        let resp = self
            .request(Method::PUT, &url)
            .body(body.to_vec())
            .send()
            .await?;
        match resp.status().as_u16() {
            200 | 201 | 204 => Ok(()),
            _ => Err(self.unexpected(resp.status(), path)),
        }
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let url = self.url(path);
        let resp = self.request(Method::GET, &url).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(resp.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(path.to_string())),
            status => Err(self.unexpected(status, path)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let url = format!("{}/", self.url(prefix));
        let resp = self
            .request(dav_method("PROPFIND")?, &url)
            .header("Depth", "1")
            .send()
            .await?;
        match resp.status().as_u16() {
            207 => {
                let body = resp.text().await?;
                parse_listing(&body, path_of(&url))
            }
            404 => Ok(Vec::new()),
            _ => Err(self.unexpected(resp.status(), prefix)),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let url = self.url(path);
        let resp = self.request(Method::DELETE, &url).send().await?;
        match resp.status().as_u16() {
            // a 404 means somebody else already removed it, which is
            // exactly the state we wanted
            200 | 204 | 404 => Ok(()),
            _ => Err(self.unexpected(resp.status(), path)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let url = self.url(from);
        let resp = self
            .request(dav_method("MOVE")?, &url)
            .header("Destination", self.url(to))
            .header("Overwrite", "F")
            .send()
            .await?;
        match resp.status().as_u16() {
            200 | 201 | 204 => Ok(()),
            404 => Err(StorageError::NotFound(from.to_string())),
            412 => Err(StorageError::AlreadyExists(to.to_string())),
            _ => Err(self.unexpected(resp.status(), from)),
        }
    }

    async fn ensure_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        // MKCOL each level, base collection included, so a fresh share
        // bootstraps itself
        let mut paths = vec![String::new()];
        let mut acc = String::new();
        for seg in prefix.split('/').filter(|s| !s.is_empty()) {
            if !acc.is_empty() {
                acc.push('/');
            }
            acc.push_str(seg);
            paths.push(acc.clone());
        }
        for path in paths {
            let url = format!("{}/", self.url(&path));
            let resp = self.request(dav_method("MKCOL")?, &url).send().await?;
            match resp.status().as_u16() {
                201 | 405 => {}
                _ => return Err(self.unexpected(resp.status(), &path)),
            }
        }
        Ok(())
    }
}

// path portion of an absolute-URI or absolute-path reference
fn path_of(href: &str) -> &str {
    match href.find("://") {
        Some(i) => {
            let rest = &href[i + 3..];
            match rest.find('/') {
                Some(j) => &rest[j..],
                None => "/",
            }
        }
        None => href,
    }
}

fn parse_listing(xml: &str, dir_path: &str) -> Result<Vec<String>, StorageError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut names = Vec::new();
    let mut in_href = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"href" => in_href = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"href" => in_href = false,
            Ok(Event::Text(e)) if in_href => {
                if let Ok(text) = e.unescape() {
                    if let Some(name) = entry_name(text.as_ref(), dir_path) {
                        names.push(name);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StorageError::Protocol(format!("bad multistatus body: {e}")));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(names)
}

// one href from the multistatus body -> plain file name; drops the
// listed collection itself, sub-collections and dot files
fn entry_name(href: &str, dir_path: &str) -> Option<String> {
    let path = path_of(href);
    if path.ends_with('/') {
        return None;
    }
    if path.trim_end_matches('/') == dir_path.trim_end_matches('/') {
        return None;
    }
    let name = path.rsplit('/').next()?;
    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    Some(name.to_string())
}
