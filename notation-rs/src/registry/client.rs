// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use reqwest::{
    header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE, LINK, LOCATION, WWW_AUTHENTICATE},
    Method, Response,
};

use super::{
    auth::{Authenticator, Challenge, Credential},
    parse_index, verify_content, Reference, RegistryError, Repository, Result,
    MANIFEST_MEDIA_TYPES, MAX_MANIFEST_SIZE, MEDIA_TYPE_IMAGE_INDEX,
};
use crate::{
    config::DEFAULT_REGISTRY_TIMEOUT,
    descriptor::Descriptor,
    digest::{Digest, DigestAlgorithm},
};

const HEADER_OCI_SUBJECT: &str = "oci-subject";
const HEADER_CONTENT_DIGEST: &str = "docker-content-digest";

const BASE_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct RemoteOptions {
    /// Talk HTTP instead of HTTPS. Implied for localhost.
    pub plain_http: bool,
    pub timeout: Duration,
    pub credential: Credential,
    /// Retries of transient failures after the first attempt.
    pub max_retries: u32,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            plain_http: false,
            timeout: DEFAULT_REGISTRY_TIMEOUT,
            credential: Credential::Anonymous,
            max_retries: 3,
        }
    }
}

#[derive(Clone, Copy)]
struct Body<'a> {
    content_type: &'a str,
    data: &'a [u8],
}

/// A repository reached over the OCI distribution API.
pub struct RemoteRepository {
    http: reqwest::Client,
    base: url::Url,
    repository: String,
    auth: Authenticator,
    max_retries: u32,
}

impl RemoteRepository {
    pub fn new(reference: &Reference, options: RemoteOptions) -> Result<Self> {
        let scheme = if options.plain_http || reference.is_localhost() {
            "http"
        } else {
            "https"
        };
        let base = url::Url::parse(&format!("{scheme}://{}/", reference.registry()))
            .map_err(|_| RegistryError::InvalidReference(reference.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|source| RegistryError::Http {
                url: base.to_string(),
                source,
            })?;
        Ok(Self {
            auth: Authenticator::new(options.credential, http.clone()),
            http,
            base,
            repository: reference.repository().to_string(),
            max_retries: options.max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}v2/{}/{path}", self.base, self.repository)
    }

    fn scope(&self, method: &Method) -> String {
        let actions = if *method == Method::GET || *method == Method::HEAD {
            "pull"
        } else {
            "pull,push"
        };
        format!("repository:{}:{actions}", self.repository)
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        accept: &[&str],
        body: Option<Body<'_>>,
    ) -> Result<Response> {
        let mut retries = 0;
        loop {
            match self.request_once(method.clone(), url, accept, body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    let base = (BASE_BACKOFF * 2u32.pow(retries - 1)).min(MAX_BACKOFF);
                    let jittered = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
                    let backoff = Duration::from_millis(jittered.max(10));
                    warn!(
                        "{method} {url}: {e}, retry {retries}/{} in {}ms",
                        self.max_retries,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once(
        &self,
        method: Method,
        url: &str,
        accept: &[&str],
        body: Option<Body<'_>>,
    ) -> Result<Response> {
        let scope = self.scope(&method);
        let mut authorization = self.auth.cached(&scope);
        let mut challenged = false;
        loop {
            let mut request = self.http.request(method.clone(), url);
            if !accept.is_empty() {
                request = request.header(ACCEPT, accept.join(", "));
            }
            if let Some(value) = &authorization {
                request = request.header(AUTHORIZATION, value);
            }
            if let Some(body) = body {
                request = request
                    .header(CONTENT_TYPE, body.content_type)
                    .body(body.data.to_vec());
            }
            let response = request.send().await.map_err(|source| RegistryError::Http {
                url: url.to_string(),
                source,
            })?;

            let status = response.status().as_u16();
            match status {
                200..=299 => return Ok(response),
                401 if !challenged => {
                    challenged = true;
                    let challenge = response
                        .headers()
                        .get(WWW_AUTHENTICATE)
                        .and_then(|v| v.to_str().ok())
                        .ok_or_else(|| RegistryError::Unauthorized(url.to_string()))
                        .and_then(Challenge::parse)?;
                    debug!("{url} requires authentication");
                    authorization = Some(self.auth.authorize(&challenge, &scope).await?);
                }
                401 | 403 => return Err(RegistryError::Unauthorized(url.to_string())),
                404 => return Err(RegistryError::NotFound(url.to_string())),
                409 | 412 => return Err(RegistryError::Conflict(url.to_string())),
                _ => {
                    return Err(RegistryError::Status {
                        url: url.to_string(),
                        status,
                    })
                }
            }
        }
    }
}

async fn read_limited(mut response: Response, url: &str, limit: u64) -> Result<Vec<u8>> {
    let too_large = || RegistryError::TooLarge {
        what: url.to_string(),
        limit,
    };
    if response.content_length().is_some_and(|len| len > limit) {
        return Err(too_large());
    }
    let mut data = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|source| RegistryError::Http {
        url: url.to_string(),
        source,
    })? {
        if (data.len() + chunk.len()) as u64 > limit {
            return Err(too_large());
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

fn media_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Target of a `Link: <url>; rel="next"` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    let (target, params) = link.split_once(';')?;
    let rel = params.replace(' ', "");
    if rel != "rel=\"next\"" && rel != "rel=next" {
        return None;
    }
    Some(
        target
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string(),
    )
}

#[async_trait]
impl Repository for RemoteRepository {
    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let url = self.url(&format!("manifests/{reference}"));
        let response = self
            .request(Method::GET, &url, MANIFEST_MEDIA_TYPES, None)
            .await?;
        let media_type = media_type(response.headers())
            .ok_or_else(|| RegistryError::InvalidResponse(format!("{url} has no content type")))?;
        let header_digest = response
            .headers()
            .get(HEADER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Digest>().ok());
        let data = read_limited(response, &url, MAX_MANIFEST_SIZE).await?;

        let digest = match reference.parse::<Digest>() {
            Ok(expected) => expected,
            Err(_) => header_digest.unwrap_or_else(|| DigestAlgorithm::Sha256.digest(&data)),
        };
        let desc = Descriptor::new(media_type, digest, data.len() as u64);
        verify_content(&desc, &data)?;
        Ok(desc)
    }

    async fn fetch_manifest(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let url = self.url(&format!("manifests/{}", desc.digest));
        let response = self
            .request(Method::GET, &url, &[desc.media_type.as_str()], None)
            .await?;
        let data = read_limited(response, &url, desc.size.min(MAX_MANIFEST_SIZE)).await?;
        verify_content(desc, &data)?;
        Ok(data)
    }

    async fn fetch_blob(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let url = self.url(&format!("blobs/{}", desc.digest));
        let response = self.request(Method::GET, &url, &[], None).await?;
        let data = read_limited(response, &url, desc.size).await?;
        verify_content(desc, &data)?;
        Ok(data)
    }

    async fn push_blob(&self, desc: &Descriptor, data: &[u8]) -> Result<()> {
        let url = self.url(&format!("blobs/{}", desc.digest));
        match self.request(Method::HEAD, &url, &[], None).await {
            Ok(_) => {
                debug!("blob {} already exists", desc.digest);
                return Ok(());
            }
            Err(RegistryError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let uploads = self.url("blobs/uploads/");
        let response = self.request(Method::POST, &uploads, &[], None).await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::InvalidResponse(format!("{uploads} returned no location")))?;
        let mut upload = self.base.join(location).map_err(|_| {
            RegistryError::InvalidResponse(format!("invalid upload location `{location}`"))
        })?;
        upload
            .query_pairs_mut()
            .append_pair("digest", &desc.digest.to_string());

        self.request(
            Method::PUT,
            upload.as_str(),
            &[],
            Some(Body {
                content_type: "application/octet-stream",
                data,
            }),
        )
        .await?;
        debug!("uploaded blob {} ({} bytes)", desc.digest, desc.size);
        Ok(())
    }

    async fn push_manifest(&self, desc: &Descriptor, data: &[u8], reference: &str) -> Result<bool> {
        let url = self.url(&format!("manifests/{reference}"));
        let response = self
            .request(
                Method::PUT,
                &url,
                &[],
                Some(Body {
                    content_type: &desc.media_type,
                    data,
                }),
            )
            .await?;
        Ok(response.headers().contains_key(HEADER_OCI_SUBJECT))
    }

    async fn referrers(
        &self,
        subject: &Descriptor,
        artifact_type: &str,
        limit: usize,
    ) -> Result<Option<Vec<Descriptor>>> {
        let mut first = url::Url::parse(&self.url(&format!("referrers/{}", subject.digest)))
            .map_err(|e| RegistryError::InvalidReference(e.to_string()))?;
        first
            .query_pairs_mut()
            .append_pair("artifactType", artifact_type);

        let mut found = Vec::new();
        let mut page = Some(first.to_string());
        let mut first_page = true;
        while let Some(url) = page.take() {
            let response = match self
                .request(Method::GET, &url, &[MEDIA_TYPE_IMAGE_INDEX], None)
                .await
            {
                Ok(response) => response,
                Err(RegistryError::NotFound(_)) if first_page => return Ok(None),
                Err(e) if first_page && e.status() == Some(400) => return Ok(None),
                Err(e) => return Err(e),
            };
            first_page = false;
            page = next_link(response.headers())
                .map(|next| self.base.join(&next).map(String::from))
                .transpose()
                .map_err(|_| RegistryError::InvalidResponse(format!("invalid link from {url}")))?;
            let data = read_limited(response, &url, MAX_MANIFEST_SIZE).await?;
            found.extend(parse_index(&data)?);
            if found.len() > limit {
                break;
            }
        }
        Ok(Some(found))
    }
}
