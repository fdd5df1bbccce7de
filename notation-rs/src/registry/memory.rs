// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;

use super::{manifest_subject, verify_content, RegistryError, Repository, Result};
use crate::{
    descriptor::Descriptor,
    digest::{Digest, DigestAlgorithm},
};

#[derive(Default)]
struct State {
    blobs: HashMap<Digest, Vec<u8>>,
    /// In push order, which is the order referrers are listed in.
    manifests: Vec<(Descriptor, Vec<u8>)>,
    tags: HashMap<String, Digest>,
}

/// A repository held in memory, for tests and dry runs.
pub struct MemoryRepository {
    state: Mutex<State>,
    referrers_api: bool,
    reject_subject: bool,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    /// A repository that indexes subjects itself, like a registry with the
    /// Referrers API.
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            referrers_api: true,
            reject_subject: false,
        }
    }

    /// A repository without the Referrers API; signatures are only found
    /// through the referrers tag.
    pub fn without_referrers_api() -> Self {
        Self {
            referrers_api: false,
            ..Self::new()
        }
    }

    /// Like [`Self::without_referrers_api`] but manifests carrying a
    /// `subject` are refused with HTTP 400.
    pub fn rejecting_subject() -> Self {
        Self {
            referrers_api: false,
            reject_subject: true,
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores an arbitrary manifest, optionally tagged, and returns its
    /// descriptor.
    pub fn add_manifest(&self, media_type: &str, data: &[u8], tag: Option<&str>) -> Descriptor {
        let desc = Descriptor::new(
            media_type,
            DigestAlgorithm::Sha256.digest(data),
            data.len() as u64,
        );
        let mut state = self.state();
        state.manifests.retain(|(d, _)| d.digest != desc.digest);
        state.manifests.push((desc.clone(), data.to_vec()));
        if let Some(tag) = tag {
            state.tags.insert(tag.to_string(), desc.digest.clone());
        }
        desc
    }

    /// Drops a manifest, as garbage collection on a registry would.
    pub fn delete_manifest(&self, digest: &Digest) {
        let mut state = self.state();
        state.manifests.retain(|(d, _)| d.digest != *digest);
        state.tags.retain(|_, d| d != digest);
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.state().tags.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn manifest_count(&self) -> usize {
        self.state().manifests.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let state = self.state();
        let digest = match reference.parse::<Digest>() {
            Ok(digest) => digest,
            Err(_) => state
                .tags
                .get(reference)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(reference.to_string()))?,
        };
        state
            .manifests
            .iter()
            .find(|(d, _)| d.digest == digest)
            .map(|(d, _)| Descriptor::new(d.media_type.clone(), d.digest.clone(), d.size))
            .ok_or_else(|| RegistryError::NotFound(reference.to_string()))
    }

    async fn fetch_manifest(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let data = self
            .state()
            .manifests
            .iter()
            .find(|(d, _)| d.digest == desc.digest)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| RegistryError::NotFound(desc.digest.to_string()))?;
        verify_content(desc, &data)?;
        Ok(data)
    }

    async fn fetch_blob(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let data = self
            .state()
            .blobs
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(desc.digest.to_string()))?;
        verify_content(desc, &data)?;
        Ok(data)
    }

    async fn push_blob(&self, desc: &Descriptor, data: &[u8]) -> Result<()> {
        verify_content(desc, data)?;
        self.state().blobs.insert(desc.digest.clone(), data.to_vec());
        Ok(())
    }

    async fn push_manifest(&self, desc: &Descriptor, data: &[u8], reference: &str) -> Result<bool> {
        let has_subject = manifest_subject(data).is_some();
        if has_subject && self.reject_subject {
            return Err(RegistryError::Status {
                url: reference.to_string(),
                status: 400,
            });
        }
        verify_content(desc, data)?;

        let mut state = self.state();
        state.manifests.retain(|(d, _)| d.digest != desc.digest);
        state.manifests.push((desc.clone(), data.to_vec()));
        if reference.parse::<Digest>().is_err() {
            state.tags.insert(reference.to_string(), desc.digest.clone());
        }
        Ok(has_subject && self.referrers_api)
    }

    async fn referrers(
        &self,
        subject: &Descriptor,
        artifact_type: &str,
        _limit: usize,
    ) -> Result<Option<Vec<Descriptor>>> {
        if !self.referrers_api {
            return Ok(None);
        }
        Ok(Some(
            self.state()
                .manifests
                .iter()
                .filter(|(d, data)| {
                    d.artifact_type.as_deref() == Some(artifact_type)
                        && manifest_subject(data).as_ref() == Some(&subject.digest)
                })
                .map(|(d, _)| d.clone())
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::registry::{referrers_tag, MEDIA_TYPE_IMAGE_MANIFEST};
    use rstest::rstest;

    const IMAGE: &[u8] = br#"{"schemaVersion":2}"#;

    async fn push(repo: &MemoryRepository, subject: &Descriptor, envelope: &[u8], force: bool) -> Descriptor {
        let mut annotations = BTreeMap::new();
        annotations.insert("k".to_string(), "v".to_string());
        repo.push_signature(subject, "application/jose+json", envelope, &annotations, force)
            .await
            .unwrap()
            .1
    }

    #[rstest]
    #[case::referrers_api(MemoryRepository::new(), false, false)]
    #[case::forced_tag(MemoryRepository::new(), true, true)]
    #[case::tag_schema(MemoryRepository::without_referrers_api(), false, true)]
    #[case::subject_rejected(MemoryRepository::rejecting_subject(), false, true)]
    #[tokio::test]
    async fn test_push_and_list(
        #[case] repo: MemoryRepository,
        #[case] force: bool,
        #[case] tagged: bool,
    ) {
        let subject = repo.add_manifest(MEDIA_TYPE_IMAGE_MANIFEST, IMAGE, Some("v1"));
        let first = push(&repo, &subject, b"sig-1", force).await;
        let second = push(&repo, &subject, b"sig-2", force).await;
        assert_eq!(first.annotations.get("k").map(String::as_str), Some("v"));

        let tag = referrers_tag(&subject.digest);
        assert_eq!(repo.tags().contains(&tag), tagged);

        let list = repo.list_signatures(&subject, 10).await.unwrap();
        assert!(!list.truncated);
        let digests: Vec<_> = list.descriptors.iter().map(|d| d.digest.clone()).collect();
        assert_eq!(digests, vec![first.digest.clone(), second.digest]);

        let (blob, envelope) = repo.fetch_signature(&first).await.unwrap();
        assert_eq!(envelope, b"sig-1");
        assert_eq!(blob.media_type, "application/jose+json");
    }

    #[tokio::test]
    async fn test_index_has_no_duplicates() {
        let repo = MemoryRepository::without_referrers_api();
        let subject = repo.add_manifest(MEDIA_TYPE_IMAGE_MANIFEST, IMAGE, Some("v1"));
        push(&repo, &subject, b"sig", false).await;
        push(&repo, &subject, b"sig", false).await;
        assert_eq!(repo.referrers_index(&subject.digest).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_truncates() {
        let repo = MemoryRepository::new();
        let subject = repo.add_manifest(MEDIA_TYPE_IMAGE_MANIFEST, IMAGE, None);
        for i in 0..3u8 {
            push(&repo, &subject, &[i], false).await;
        }
        let list = repo.list_signatures(&subject, 2).await.unwrap();
        assert_eq!(list.descriptors.len(), 2);
        assert!(list.truncated);
    }

    #[tokio::test]
    async fn test_deleted_subject_is_not_found() {
        let repo = MemoryRepository::new();
        let subject = repo.add_manifest(MEDIA_TYPE_IMAGE_MANIFEST, IMAGE, Some("v1"));
        repo.delete_manifest(&subject.digest);
        assert!(matches!(
            repo.resolve("v1").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            repo.resolve(&subject.digest.to_string()).await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
