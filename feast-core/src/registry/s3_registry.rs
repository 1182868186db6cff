use crate::error::{BackendContext, FeastError, Result};
use crate::registry::registry_store::{RegistryStore, stale};
use crate::registry::snapshot::RegistrySnapshot;
use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

/// Statuses S3 answers a conditional put with when the object changed underneath it.
fn is_conflict_status(status: u16) -> bool {
    status == 412 || status == 409
}

/// Registry object in S3. Saves are conditional on the ETag the version check read, so a
/// concurrent writer between check and put surfaces as `StaleRegistry`.
pub struct S3RegistryStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    location: String,
}

fn parse_s3_url(s3_url: &str) -> Result<(String, String)> {
    let url = url::Url::parse(s3_url)
        .map_err(|e| FeastError::validation(format!("Invalid S3 URL {}: {}", s3_url, e)))?;
    if url.scheme() != "s3" {
        return Err(FeastError::validation(format!(
            "Invalid S3 URL scheme in {}",
            s3_url
        )));
    }
    let bucket = url
        .host_str()
        .ok_or_else(|| FeastError::validation(format!("S3 URL {} has no bucket", s3_url)))?
        .to_string();
    let key = url.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(FeastError::validation(format!(
            "S3 URL {} has no object key",
            s3_url
        )));
    }
    Ok((bucket, key))
}

impl S3RegistryStore {
    pub async fn from_url(s3_url: &str) -> Result<Self> {
        let (bucket, key) = parse_s3_url(s3_url)?;
        let config = aws_config::load_from_env().await;
        let client = aws_sdk_s3::Client::new(&config);
        Ok(Self::new(client, bucket, key))
    }

    pub fn new(client: aws_sdk_s3::Client, bucket: String, key: String) -> Self {
        let location = format!("s3://{}/{}", bucket, key);
        Self {
            client,
            bucket,
            key,
            location,
        }
    }

    /// Object bytes with their ETag, or `None` when the object does not exist.
    async fn read_object(&self) -> Result<Option<(Vec<u8>, Option<String>)>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await;
        let object = match response {
            Ok(object) => object,
            Err(SdkError::ServiceError(err)) if matches!(err.err(), GetObjectError::NoSuchKey(_)) => {
                return Ok(None);
            }
            Err(err) => {
                return Err(err)
                    .with_backend(|| format!("Failed to fetch registry {}", self.location));
            }
        };
        let e_tag = object.e_tag().map(str::to_string);
        let data = object
            .body
            .collect()
            .await
            .with_backend(|| format!("Failed to read registry {}", self.location))?;
        Ok(Some((data.into_bytes().to_vec(), e_tag)))
    }

    async fn stored_version(&self) -> Result<u64> {
        match self.read_object().await? {
            Some((bytes, _)) => Ok(RegistrySnapshot::decode(&bytes)?.version),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl RegistryStore for S3RegistryStore {
    async fn load(&self) -> Result<RegistrySnapshot> {
        match self.read_object().await? {
            Some((bytes, _)) => RegistrySnapshot::decode(&bytes),
            None => {
                debug!("Registry {} does not exist yet", self.location);
                Ok(RegistrySnapshot::default())
            }
        }
    }

    async fn save(&self, snapshot: &RegistrySnapshot, expected_version: u64) -> Result<()> {
        let (found, e_tag) = match self.read_object().await? {
            Some((bytes, e_tag)) => (RegistrySnapshot::decode(&bytes)?.version, e_tag),
            None => (0, None),
        };
        if found != expected_version {
            return Err(stale(&self.location, expected_version, found));
        }
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(snapshot.encode()));
        let request = match e_tag {
            Some(e_tag) => request.if_match(e_tag),
            None => request.if_none_match("*"),
        };
        if let Err(err) = request.send().await {
            let conflict = err
                .raw_response()
                .is_some_and(|response| is_conflict_status(response.status().as_u16()));
            if conflict {
                let found = self.stored_version().await?;
                return Err(stale(&self.location, expected_version, found));
            }
            return Err(err).with_backend(|| format!("Failed to write registry {}", self.location));
        }
        debug!(
            "Saved registry {} at version {}",
            self.location, snapshot.version
        );
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .with_backend(|| format!("Failed to remove registry {}", self.location))?;
        Ok(())
    }

    fn location(&self) -> &str {
        &self.location
    }
}
