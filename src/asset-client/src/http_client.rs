use crate::wire::{LinkedAssetsResponse, ListResponse, WireEntry};
use futures_util::StreamExt;
use log::warn;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response, StatusCode};
use rq_lib::{path, AssetChunk, ByteReader, RqError, RqResult};
use std::time::Duration;
use tokio_util::io::StreamReader;
use url::Url;

/// Characters escaped inside one path segment. `/` never appears here since
/// encoding is per segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'`')
    .add(b'{')
    .add(b'}');

pub fn encode_tree_path(tree_path: &str) -> String {
    let mut out = String::with_capacity(tree_path.len());
    for seg in tree_path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(&utf8_percent_encode(seg, SEGMENT).to_string());
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Generic JSON-over-HTTP client for the remote content tree: listings,
/// streamed reads, directory creation, the WCM command endpoint for deletes
/// and MOVE/COPY with destination headers. Asset-specific behavior layers on
/// top in `AssetClient`.
pub struct HttpTreeClient {
    base_url: Url,
    client: Client,
    auth_token: Option<String>,
}

impl HttpTreeClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        auth_token: Option<String>,
    ) -> RqResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RqError::InvalidParam(format!("base url {}: {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RqError::Internal(format!("failed to create http client: {}", e)))?;
        Ok(Self {
            base_url,
            client,
            auth_token,
        })
    }

    fn url_for(&self, tree_path: &str, suffix: &str) -> RqResult<Url> {
        let raw = format!(
            "{}{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            encode_tree_path(tree_path),
            suffix
        );
        Url::parse(&raw).map_err(|e| RqError::InvalidParam(format!("url {}: {}", raw, e)))
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> RqResult<Response> {
        let res = self
            .apply_auth(req)
            .send()
            .await
            .map_err(|e| RqError::Network(format!("{}: {}", what, e)))?;
        let status = res.status();
        if !status.is_success() {
            return Err(RqError::from_http_status(status.as_u16(), what.to_string()));
        }
        Ok(res)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url, what: &str) -> RqResult<T> {
        let res = self.send(self.client.get(url), what).await?;
        let body = res
            .text()
            .await
            .map_err(|e| RqError::Network(format!("{} body: {}", what, e)))?;
        serde_json::from_str(&body).map_err(|e| RqError::Parse(format!("{}: {}", what, e)))
    }

    pub async fn list(&self, parent: &str) -> RqResult<Vec<WireEntry>> {
        let url = self.url_for(parent, ".1.json")?;
        let resp: ListResponse = self.get_json(url, &format!("list {}", parent)).await?;
        Ok(resp.entries)
    }

    pub async fn stat(&self, tree_path: &str) -> RqResult<WireEntry> {
        let url = self.url_for(tree_path, ".json")?;
        self.get_json(url, &format!("stat {}", tree_path)).await
    }

    pub async fn open_stream(&self, tree_path: &str) -> RqResult<ByteReader> {
        let url = self.url_for(tree_path, "")?;
        let res = self
            .send(self.client.get(url), &format!("open {}", tree_path))
            .await?;
        let stream = res.bytes_stream().map(|chunk| {
            chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        });
        Ok(Box::pin(StreamReader::new(stream)))
    }

    pub async fn create_directory(&self, tree_path: &str) -> RqResult<()> {
        let url = self.url_for(tree_path, "")?;
        let form = [("./jcr:primaryType", "sling:OrderedFolder"), ("_charset_", "utf-8")];
        self.send(
            self.client.post(url).form(&form),
            &format!("create directory {}", tree_path),
        )
        .await?;
        Ok(())
    }

    /// Deletes go through the WCM command endpoint rather than the node URL.
    pub async fn delete(&self, tree_path: &str) -> RqResult<()> {
        let url = Url::parse(&format!(
            "{}/bin/wcmcommand",
            self.base_url.as_str().trim_end_matches('/')
        ))
        .map_err(|e| RqError::Internal(format!("wcmcommand url: {}", e)))?;
        let form = [
            ("cmd", "deletePage"),
            ("path", tree_path),
            ("force", "true"),
            ("_charset_", "utf-8"),
        ];
        self.send(
            self.client.post(url).form(&form),
            &format!("delete {}", tree_path),
        )
        .await?;
        Ok(())
    }

    async fn move_or_copy(
        &self,
        method: &str,
        from: &str,
        to: &str,
        overwrite: bool,
    ) -> RqResult<()> {
        let url = self.url_for(from, "")?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| RqError::Internal(format!("http method: {}", e)))?;
        let req = self
            .client
            .request(method.clone(), url)
            .header("X-Destination", encode_tree_path(to))
            .header("X-Depth", "infinity")
            .header("X-Overwrite", if overwrite { "T" } else { "F" });
        self.send(req, &format!("{} {} -> {}", method, from, to))
            .await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str, overwrite: bool) -> RqResult<()> {
        self.move_or_copy("MOVE", from, to, overwrite).await
    }

    pub async fn copy(&self, from: &str, to: &str) -> RqResult<()> {
        self.move_or_copy("COPY", from, to, false).await
    }

    /// One multipart chunk against the createasset endpoint. The first chunk
    /// carries `file@Length`; the final one adds `file@Completed`.
    pub async fn post_asset_chunk(&self, tree_path: &str, chunk: AssetChunk) -> RqResult<()> {
        let parent = path::parent_of(tree_path);
        let name = path::name_of(tree_path).to_string();
        let url = self.url_for(parent, ".createasset.html")?;

        let mut form = Form::new()
            .text("_charset_", "utf-8")
            .text("file@Offset", chunk.offset.to_string())
            .text("chunk@Length", chunk.data.len().to_string());
        if chunk.offset == 0 {
            form = form.text("file@Length", chunk.file_size.to_string());
        }
        if chunk.completed {
            form = form.text("file@Completed", "true");
        }
        form = form.part("file", Part::bytes(chunk.data).file_name(name));

        let res = self
            .apply_auth(self.client.post(url).multipart(form))
            .send()
            .await
            .map_err(|e| RqError::Network(format!("upload chunk {}: {}", tree_path, e)))?;
        let status = res.status();
        if status == StatusCode::LOCKED {
            warn!("upload rejected, {} is checked out", tree_path);
            return Err(RqError::AccessDenied(format!("checked out: {}", tree_path)));
        }
        if !status.is_success() {
            return Err(RqError::from_http_status(
                status.as_u16(),
                format!("upload chunk {}", tree_path),
            ));
        }
        Ok(())
    }

    pub async fn linked_assets(&self, tree_path: &str) -> RqResult<Vec<String>> {
        let url = self.url_for(tree_path, ".assets.json")?;
        let resp: LinkedAssetsResponse = self
            .get_json(url, &format!("linked assets {}", tree_path))
            .await?;
        Ok(resp.assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_tree_path() {
        assert_eq!(encode_tree_path("/a/b.txt"), "/a/b.txt");
        assert_eq!(encode_tree_path("/my docs/r&d.txt"), "/my%20docs/r&d.txt");
        assert_eq!(encode_tree_path("/a/100%.txt"), "/a/100%25.txt");
        assert_eq!(encode_tree_path("/"), "/");
    }

    #[test]
    fn test_url_for_keeps_base_path() {
        let client =
            HttpTreeClient::new("http://host:4502/content", Duration::from_secs(5), None).unwrap();
        let url = client.url_for("/dam/a b.jpg", ".json").unwrap();
        assert_eq!(url.as_str(), "http://host:4502/content/dam/a%20b.jpg.json");
    }

    #[test]
    fn test_bad_base_url_rejected() {
        assert!(HttpTreeClient::new("not a url", Duration::from_secs(1), None).is_err());
    }
}
