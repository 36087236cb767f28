use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};

use crate::domain::entities::{
    CommentInfo, InlineComment, PullRequestDetails, PullRequestFile, PullReviewInfo,
};
use crate::domain::ports::ForgeRepository;

const REVIEW_COMMENTS_PAGE: u8 = 100;
const REVIEWS_PAGE: u8 = 50;
const FILES_PAGE: u8 = 100;

/// GitHub client authenticated as a GitHub App. Each call resolves (and
/// caches) the installation for `(owner, repo)` and acts with an
/// installation-scoped client; octocrab handles installation token refresh.
pub struct OctocrabForge {
    app_client: octocrab::Octocrab,
    installations: Mutex<HashMap<String, u64>>,
    api_semaphore: Arc<Semaphore>,
}

impl OctocrabForge {
    pub fn new(app_id: u64, private_key_pem: &str, max_concurrent_api: usize) -> Result<Self> {
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .context("failed to parse GitHub App private key")?;
        let app_client = octocrab::Octocrab::builder()
            .app(app_id.into(), key)
            .build()
            .context("failed to build GitHub App client")?;
        Ok(Self {
            app_client,
            installations: Mutex::new(HashMap::new()),
            api_semaphore: Arc::new(Semaphore::new(max_concurrent_api.max(1))),
        })
    }

    async fn acquire_api_permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.api_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| anyhow::anyhow!("api semaphore closed: {e}"))
    }

    async fn installation_client(&self, owner: &str, repo: &str) -> Result<octocrab::Octocrab> {
        let full_name = format!("{owner}/{repo}");

        let cached = {
            let cache = self.installations.lock().await;
            cache.get(&full_name).copied()
        };

        let installation_id = match cached {
            Some(id) => id,
            None => {
                #[derive(Debug, Deserialize)]
                struct InstallationDto {
                    id: u64,
                }
                let route = format!("/repos/{owner}/{repo}/installation");
                let installation: InstallationDto = self
                    .app_client
                    .get(route, None::<&()>)
                    .await
                    .with_context(|| format!("failed to find installation for {full_name}"))?;
                let mut cache = self.installations.lock().await;
                cache.insert(full_name, installation.id);
                installation.id
            }
        };

        // Installation tokens are short-lived; minting one per acquisition
        // keeps the client stateless about expiry.
        #[derive(Debug, Deserialize)]
        struct AccessTokenDto {
            token: String,
        }
        let route = format!("/app/installations/{installation_id}/access_tokens");
        let access: AccessTokenDto = self
            .app_client
            .post(route, None::<&()>)
            .await
            .context("failed to create installation token")?;

        octocrab::Octocrab::builder()
            .personal_token(access.token)
            .build()
            .context("failed to build installation client")
    }
}

#[async_trait]
impl ForgeRepository for OctocrabForge {
    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<PullRequestDetails> {
        #[derive(Debug, Deserialize)]
        struct PullDto {
            number: u64,
            title: Option<String>,
            body: Option<String>,
            state: Option<String>,
            head: HeadDto,
        }
        #[derive(Debug, Deserialize)]
        struct HeadDto {
            sha: String,
        }

        let client = self.installation_client(owner, repo).await?;
        let _permit = self.acquire_api_permit().await?;
        let route = format!("/repos/{owner}/{repo}/pulls/{pr_number}");
        let pr: PullDto = client.get(route, None::<&()>).await?;
        Ok(PullRequestDetails {
            number: pr.number,
            title: pr.title.unwrap_or_else(|| "(no title)".to_string()),
            body: pr.body.unwrap_or_default(),
            state: pr.state.unwrap_or_default(),
            head_sha: pr.head.sha,
        })
    }

    async fn get_pull_request_diff(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<String> {
        let client = self.installation_client(owner, repo).await?;
        let _permit = self.acquire_api_permit().await?;
        let diff = client
            .pulls(owner, repo)
            .get_diff(pr_number)
            .await
            .context("failed to get PR diff")?;
        Ok(diff)
    }

    async fn list_pull_request_files(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<PullRequestFile>> {
        #[derive(Debug, Deserialize)]
        struct FileDto {
            filename: String,
            status: Option<String>,
            additions: Option<u64>,
            deletions: Option<u64>,
            patch: Option<String>,
        }

        let client = self.installation_client(owner, repo).await?;
        let _permit = self.acquire_api_permit().await?;
        let route =
            format!("/repos/{owner}/{repo}/pulls/{pr_number}/files?per_page={FILES_PAGE}");
        let files: Vec<FileDto> = client.get(route, None::<&()>).await?;
        Ok(files
            .into_iter()
            .map(|f| PullRequestFile {
                path: f.filename,
                status: f.status.unwrap_or_else(|| "modified".to_string()),
                additions: f.additions.unwrap_or(0),
                deletions: f.deletions.unwrap_or(0),
                patch: f.patch,
            })
            .collect())
    }

    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<()> {
        let client = self.installation_client(owner, repo).await?;
        let _permit = self.acquire_api_permit().await?;
        client
            .issues(owner, repo)
            .create_comment(issue_number, body)
            .await
            .context("failed to create comment")?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        owner: &str,
        repo: &str,
        comment_id: u64,
        reaction: &str,
    ) -> Result<()> {
        let client = self.installation_client(owner, repo).await?;
        let _permit = self.acquire_api_permit().await?;
        let route = format!("/repos/{owner}/{repo}/issues/comments/{comment_id}/reactions");
        let payload = json!({ "content": reaction });
        let _: serde_json::Value = client
            .post(route, Some(&payload))
            .await
            .context("failed to add reaction")?;
        Ok(())
    }

    async fn submit_inline_review(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
        commit_sha: &str,
        body: &str,
        comments: &[InlineComment],
    ) -> Result<()> {
        let client = self.installation_client(owner, repo).await?;
        let _permit = self.acquire_api_permit().await?;
        let route = format!("/repos/{owner}/{repo}/pulls/{pr_number}/reviews");
        let comments = comments
            .iter()
            .map(|c| {
                json!({
                    "path": c.path,
                    "line": c.line,
                    "side": "RIGHT",
                    "body": c.body,
                })
            })
            .collect::<Vec<_>>();

        let payload = json!({
            "commit_id": commit_sha,
            "body": body,
            "event": "COMMENT",
            "comments": comments,
        });

        let _: serde_json::Value = client
            .post(route, Some(&payload))
            .await
            .context("failed to create review")?;
        Ok(())
    }

    async fn list_review_comments(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<CommentInfo>> {
        #[derive(Debug, Deserialize)]
        struct CommentDto {
            body: Option<String>,
            path: Option<String>,
            line: Option<u32>,
            user: Option<UserDto>,
        }
        #[derive(Debug, Deserialize)]
        struct UserDto {
            login: String,
            #[serde(rename = "type")]
            user_type: Option<String>,
        }

        let client = self.installation_client(owner, repo).await?;
        let _permit = self.acquire_api_permit().await?;
        let route = format!(
            "/repos/{owner}/{repo}/pulls/{pr_number}/comments?per_page={REVIEW_COMMENTS_PAGE}"
        );
        let items: Vec<CommentDto> = client.get(route, None::<&()>).await?;
        Ok(items
            .into_iter()
            .map(|c| {
                let (author, author_type) = match c.user {
                    Some(u) => (u.login, u.user_type.unwrap_or_default()),
                    None => (String::new(), String::new()),
                };
                CommentInfo {
                    author,
                    author_type,
                    path: c.path.unwrap_or_default(),
                    line: c.line.unwrap_or(0),
                    body: c.body.unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn list_reviews(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<PullReviewInfo>> {
        #[derive(Debug, Deserialize)]
        struct ReviewDto {
            body: Option<String>,
            state: Option<String>,
            user: Option<UserDto>,
        }
        #[derive(Debug, Deserialize)]
        struct UserDto {
            login: String,
        }

        let client = self.installation_client(owner, repo).await?;
        let _permit = self.acquire_api_permit().await?;
        let route =
            format!("/repos/{owner}/{repo}/pulls/{pr_number}/reviews?per_page={REVIEWS_PAGE}");
        let items: Vec<ReviewDto> = client.get(route, None::<&()>).await?;
        Ok(items
            .into_iter()
            .map(|r| PullReviewInfo {
                author: r.user.map(|u| u.login).unwrap_or_default(),
                state: r.state.unwrap_or_default(),
                body: r.body.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_labels(&self, owner: &str, repo: &str, issue_number: u64) -> Result<Vec<String>> {
        #[derive(Debug, Deserialize)]
        struct LabelDto {
            name: String,
        }

        let client = self.installation_client(owner, repo).await?;
        let _permit = self.acquire_api_permit().await?;
        let route = format!("/repos/{owner}/{repo}/issues/{issue_number}/labels");
        let labels: Vec<LabelDto> = client.get(route, None::<&()>).await?;
        Ok(labels.into_iter().map(|l| l.name).collect())
    }
}
