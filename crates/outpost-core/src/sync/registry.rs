//! Node identity, registration and bearer tokens.

use std::sync::OnceLock;
use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::context::SyncContext;
use super::tracker::enqueue_snapshot;
use crate::db::{LibSqlNodeRepository, NodeRepository};
use crate::error::{Error, Result};
use crate::models::{NodeId, SyncNode};
use crate::util::normalize_text_option;

/// Shortest accepted HMAC secret, in bytes
pub const MIN_SECRET_LEN: usize = 32;
pub const TOKEN_ISSUER: &str = "outpost";
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3650 * 24 * 60 * 60);

/// Claims embedded in a node token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Node id
    pub sub: String,
    pub code: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

impl TokenClaims {
    pub fn node_id(&self) -> Result<NodeId> {
        self.sub
            .parse()
            .map_err(|_| Error::Auth("token subject is not a node id".to_string()))
    }
}

/// Issues and verifies HS256 node tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("secret", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::InvalidInput(format!(
                "token secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        })
    }

    pub fn issue(&self, node: &SyncNode) -> Result<String> {
        let iat = chrono::Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            sub: node.id.as_str(),
            code: node.code.clone(),
            iss: TOKEN_ISSUER.to_string(),
            iat,
            exp: iat.saturating_add(ttl),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Auth(format!("failed to sign token: {e}")))
    }

    /// Check signature, issuer and expiry without touching the database.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        decode::<TokenClaims>(token.trim(), &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Auth(format!("token validation failed: {e}")))
    }
}

/// A freshly registered node and its bearer token
#[derive(Clone)]
pub struct Registration {
    pub node: SyncNode,
    pub auth_token: String,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("node", &self.node)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

fn code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("node code pattern is valid")
    })
}

/// Trim and check a node code.
pub fn validate_code(code: &str) -> Result<String> {
    let code = code.trim();
    if code_pattern().is_match(code) {
        Ok(code.to_string())
    } else {
        Err(Error::InvalidInput(format!(
            "node code `{code}` must be 1-64 letters, digits, `-` or `_`, starting with a letter or digit"
        )))
    }
}

/// Identity and authentication for every node known to a database.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    ctx: SyncContext,
    tokens: TokenIssuer,
}

impl NodeRegistry {
    pub fn new(ctx: SyncContext, tokens: TokenIssuer) -> Self {
        Self { ctx, tokens }
    }

    pub const fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Return this database's own node row, creating it on first start.
    pub async fn ensure_local_node(&self, code: &str, name: &str) -> Result<SyncNode> {
        let code = validate_code(code)?;
        let db = self.ctx.db().lock().await;
        let nodes = LibSqlNodeRepository::new(db.connection());

        if let Some(local) = nodes.local().await? {
            if !local.code.eq_ignore_ascii_case(&code) {
                tracing::warn!(
                    configured = %code,
                    stored = %local.code,
                    "Configured node code differs from the stored identity; keeping the stored one"
                );
            }
            return Ok(local);
        }

        let mut node = SyncNode::new(NodeId::new(), code, name.trim());
        node.is_local = true;
        node.is_server = self.ctx.role().is_server();
        node.schema_version = Some(self.ctx.schema().version());
        nodes.insert(&node).await?;

        tracing::info!(node_id = %node.id, code = %node.code, "Created local node identity");
        Ok(node)
    }

    /// Register a new peer and queue every existing entity for it.
    ///
    /// Fails with `DuplicateCode` if the code is taken, whatever its case.
    pub async fn register(
        &self,
        code: &str,
        name: &str,
        description: Option<String>,
    ) -> Result<Registration> {
        let code = validate_code(code)?;
        let name = normalize_text_option(Some(name.to_string()))
            .ok_or_else(|| Error::InvalidInput("node name must not be empty".to_string()))?;

        let mut node = SyncNode::new(NodeId::new(), code, name);
        node.description = normalize_text_option(description);

        let db = self.ctx.db().lock().await;
        db.begin().await?;
        let result = async {
            let nodes = LibSqlNodeRepository::new(db.connection());
            if nodes.get_by_code(&node.code).await?.is_some() {
                return Err(Error::DuplicateCode(node.code.clone()));
            }
            nodes.insert(&node).await?;
            enqueue_snapshot(db.connection(), &node.id).await
        }
        .await;
        let queued = db.finish(result).await?;
        drop(db);

        let auth_token = self.tokens.issue(&node)?;
        tracing::info!(
            node_id = %node.id,
            code = %node.code,
            queued,
            "Registered node"
        );
        Ok(Registration { node, auth_token })
    }

    /// Stateless token check.
    pub fn verify_token(&self, token: &str) -> Result<TokenClaims> {
        self.tokens.verify(token)
    }

    /// Resolve a bearer token to an active, registered peer.
    pub async fn authenticate(&self, token: &str) -> Result<SyncNode> {
        let result = self.authenticate_inner(token).await;
        if let Err(error) = &result {
            tracing::warn!(target: "outpost::security", "Rejected node token: {error}");
        }
        result
    }

    async fn authenticate_inner(&self, token: &str) -> Result<SyncNode> {
        let claims = self.verify_token(token)?;
        let node_id = claims.node_id()?;

        let db = self.ctx.db().lock().await;
        let node = LibSqlNodeRepository::new(db.connection())
            .get(&node_id)
            .await?
            .ok_or_else(|| Error::Auth(format!("node {node_id} is not registered")))?;

        if node.is_local {
            return Err(Error::Auth("token names this node".to_string()));
        }
        if !node.is_active {
            return Err(Error::Auth(format!("node {} is deactivated", node.code)));
        }
        if !node.code.eq_ignore_ascii_case(&claims.code) {
            return Err(Error::Auth("token code does not match the node".to_string()));
        }
        Ok(node)
    }

    /// Stop accepting a node's token and stop queueing changes for it.
    pub async fn deactivate(&self, node_id: &NodeId) -> Result<()> {
        let db = self.ctx.db().lock().await;
        LibSqlNodeRepository::new(db.connection())
            .set_active(node_id, false)
            .await?;
        tracing::warn!(node_id = %node_id, "Deactivated node");
        Ok(())
    }
}
