use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

pub const OP_PR_ANALYSIS: &str = "pr_analysis";
pub const OP_CHECK_RUN_CREATE: &str = "check_run_create";
pub const OP_REPORT_GENERATION: &str = "report_generation";

/// Composite identity of an idempotent operation.
///
/// The rendered form keeps a fixed field order so that the digest is
/// reproducible by any producer of the same key:
///
/// ```text
/// {org_id}:{operation_type}:{repo_full_name}:{head_sha}[:pr:{n}][:{discriminator}]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub org_id: Uuid,
    pub operation_type: String,
    pub repo_full_name: String,
    pub head_sha: String,
    pub pr_number: Option<u64>,
    pub discriminator: String,
}

impl IdempotencyKey {
    pub fn new(org_id: Uuid, operation_type: impl Into<String>) -> Self {
        Self {
            org_id,
            operation_type: operation_type.into(),
            repo_full_name: String::new(),
            head_sha: String::new(),
            pr_number: None,
            discriminator: String::new(),
        }
    }

    pub fn with_repository(mut self, repo_full_name: impl Into<String>) -> Self {
        self.repo_full_name = repo_full_name.into();
        self
    }

    pub fn with_head_sha(mut self, head_sha: impl Into<String>) -> Self {
        self.head_sha = head_sha.into();
        self
    }

    pub fn with_pr_number(mut self, pr_number: u64) -> Self {
        self.pr_number = Some(pr_number);
        self
    }

    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = discriminator.into();
        self
    }

    /// Key for analysing one revision of a pull request.
    pub fn pr_analysis(
        org_id: Uuid,
        repo_full_name: impl Into<String>,
        pr_number: u64,
        head_sha: impl Into<String>,
    ) -> Self {
        Self::new(org_id, OP_PR_ANALYSIS)
            .with_repository(repo_full_name)
            .with_pr_number(pr_number)
            .with_head_sha(head_sha)
    }

    /// Key for creating a named check run on a commit.
    pub fn check_run(
        org_id: Uuid,
        repo_full_name: impl Into<String>,
        head_sha: impl Into<String>,
        check_name: impl Into<String>,
    ) -> Self {
        Self::new(org_id, OP_CHECK_RUN_CREATE)
            .with_repository(repo_full_name)
            .with_head_sha(head_sha)
            .with_discriminator(check_name)
    }

    /// Key for generating a report of a given type for a commit.
    pub fn report_generation(
        org_id: Uuid,
        repo_full_name: impl Into<String>,
        head_sha: impl Into<String>,
        report_type: impl Into<String>,
    ) -> Self {
        Self::new(org_id, OP_REPORT_GENERATION)
            .with_repository(repo_full_name)
            .with_head_sha(head_sha)
            .with_discriminator(report_type)
    }

    /// Lowercase hex SHA-256 of the rendered key; used as the storage key.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.org_id, self.operation_type, self.repo_full_name, self.head_sha
        )?;

        if let Some(pr_number) = self.pr_number {
            write!(f, ":pr:{}", pr_number)?;
        }

        if !self.discriminator.is_empty() {
            write!(f, ":{}", self.discriminator)?;
        }

        Ok(())
    }
}
