//! Bearer-token authentication and table-level permissions.
//!
//! Passwords are argon2-hashed. Tokens are opaque random strings handed out
//! by login; only their sha-256 digest is stored, so the table never holds a
//! usable credential. Permission codes come from direct grants plus active
//! delegations; the superadmin role bypasses permission checks entirely.

use std::collections::HashSet;
use std::str::FromStr;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use overhaul_core::models::{now_millis, Role};
use overhaul_core::tables::TableDef;
use overhaul_core::{SyncError, SyncResult};
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::sink::Actor;
use crate::AppState;

const TOKEN_PREFIX: &str = "ovh_";

/// Permission that lets an admin-tier account bypass the approval queue.
pub const GLOBAL_EDIT: &str = "edit.all";

#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
    pub permissions: HashSet<String>,
}

impl AuthedUser {
    pub fn has_permission(&self, code: &str) -> bool {
        self.role == Role::Superadmin || self.permissions.contains(code)
    }

    /// Roles that skip the approval queue on pushes to foreign-owned rows.
    pub fn auto_approves(&self) -> bool {
        match self.role {
            Role::Superadmin => true,
            Role::Admin => self.permissions.contains(GLOBAL_EDIT),
            _ => false,
        }
    }

    pub fn require_push(&self, table: &TableDef) -> SyncResult<()> {
        if let Some(code) = table.push_permission() {
            if !self.has_permission(code) {
                return Err(SyncError::Forbidden(format!(
                    "{} requires permission {code}",
                    table.name
                )));
            }
        }
        Ok(())
    }

    /// Holds review authority over at least one access class.
    pub fn is_reviewer(&self) -> bool {
        self.auto_approves()
            || overhaul_core::tables::REVIEW_PERMISSIONS
                .iter()
                .any(|code| self.has_permission(code))
    }

    pub fn require_reviewer(&self) -> SyncResult<()> {
        if self.is_reviewer() {
            Ok(())
        } else {
            Err(SyncError::Forbidden(
                "reviewing change requests requires an approval permission".to_string(),
            ))
        }
    }

    /// Review authority is scoped per access class, mirroring push authority.
    pub fn require_review(&self, table: &TableDef) -> SyncResult<()> {
        let code = table.review_permission();
        if self.auto_approves() || self.has_permission(code) {
            Ok(())
        } else {
            Err(SyncError::Forbidden(format!(
                "deciding change requests on {} requires permission {code}",
                table.name
            )))
        }
    }

    pub fn require_superadmin(&self) -> SyncResult<()> {
        if self.role == Role::Superadmin {
            Ok(())
        } else {
            Err(SyncError::Forbidden(
                "administrative access required".to_string(),
            ))
        }
    }

    pub fn as_actor(&self) -> Actor {
        Actor {
            user_id: self.id,
            username: self.username.clone(),
        }
    }
}

pub fn hash_password(password: &str) -> SyncResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> SyncResult<bool> {
    let parsed = PasswordHash::new(hash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    format!("{TOKEN_PREFIX}{}", hex::encode(bytes))
}

/// Digest stored at rest; the raw token exists only on the wire.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub async fn issue_token(pool: &PgPool, user_id: Uuid) -> SyncResult<String> {
    let token = generate_token();
    sqlx::query(
        r#"
        INSERT INTO auth_tokens (token_hash, user_id, created_at)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(token_digest(&token))
    .bind(user_id)
    .bind(now_millis())
    .execute(pool)
    .await?;
    Ok(token)
}

pub async fn login(pool: &PgPool, username: &str, password: &str) -> SyncResult<(AuthedUser, String)> {
    let row = sqlx::query(
        r#"
        SELECT id, username, password_hash, role
        FROM users
        WHERE username = $1 AND is_active AND deleted_at IS NULL
        "#,
    )
    .bind(username)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| SyncError::AuthRequired("invalid credentials".to_string()))?;

    let password_hash: String = row.try_get("password_hash")?;
    if !verify_password(password, &password_hash)? {
        return Err(SyncError::AuthRequired("invalid credentials".to_string()));
    }

    let id: Uuid = row.try_get("id")?;
    let user = AuthedUser {
        id,
        username: row.try_get("username")?,
        role: parse_role(row.try_get("role")?)?,
        permissions: load_permissions(pool, id).await?,
    };
    let token = issue_token(pool, id).await?;
    Ok((user, token))
}

/// Resolve a `Bearer` token to its account, or fail with `auth_required`.
pub async fn authenticate(pool: &PgPool, bearer: &str) -> SyncResult<AuthedUser> {
    let token = bearer
        .strip_prefix("Bearer ")
        .ok_or_else(|| SyncError::AuthRequired("malformed authorization header".to_string()))?;

    if !token.starts_with(TOKEN_PREFIX) {
        return Err(SyncError::AuthRequired("unrecognized token".to_string()));
    }

    let digest = token_digest(token);
    let row = sqlx::query(
        r#"
        SELECT u.id, u.username, u.role
        FROM auth_tokens t
        JOIN users u ON u.id = t.user_id
        WHERE t.token_hash = $1 AND t.is_active
          AND u.is_active AND u.deleted_at IS NULL
        "#,
    )
    .bind(&digest)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| SyncError::AuthRequired("unknown or revoked token".to_string()))?;

    sqlx::query("UPDATE auth_tokens SET last_used_at = $2 WHERE token_hash = $1")
        .bind(&digest)
        .bind(now_millis())
        .execute(pool)
        .await?;

    let id: Uuid = row.try_get("id")?;
    Ok(AuthedUser {
        id,
        username: row.try_get("username")?,
        role: parse_role(row.try_get("role")?)?,
        permissions: load_permissions(pool, id).await?,
    })
}

/// Direct grants plus delegations that are neither revoked nor expired.
async fn load_permissions(pool: &PgPool, user_id: Uuid) -> SyncResult<HashSet<String>> {
    let rows = sqlx::query(
        r#"
        SELECT p.code
        FROM user_permissions up
        JOIN permissions p ON p.id = up.permission_id
        WHERE up.user_id = $1
        UNION
        SELECT p.code
        FROM permission_delegations d
        JOIN permissions p ON p.id = d.permission_id
        WHERE d.to_user_id = $1
          AND d.revoked_at IS NULL
          AND (d.expires_at IS NULL OR d.expires_at > $2)
        "#,
    )
    .bind(user_id)
    .bind(now_millis())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| Ok(row.try_get::<String, _>("code")?))
        .collect()
}

pub async fn create_user(
    pool: &PgPool,
    username: &str,
    password: &str,
    role: Role,
    grants: &[String],
) -> SyncResult<Uuid> {
    let id = Uuid::new_v4();
    let now = now_millis();

    let mut tx = pool.begin().await?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO users (id, username, password_hash, role, is_active, created_at, updated_at)
        VALUES ($1, $2, $3, $4, TRUE, $5, $5)
        "#,
    )
    .bind(id)
    .bind(username)
    .bind(hash_password(password)?)
    .bind(role.to_string())
    .bind(now)
    .execute(&mut *tx)
    .await;

    if let Err(error) = inserted {
        let taken = error
            .as_database_error()
            .and_then(|e| e.code())
            .map(|code| code.as_ref() == "23505")
            .unwrap_or(false);
        return Err(if taken {
            SyncError::validation(format!("username {username} already taken"))
        } else {
            error.into()
        });
    }

    if !grants.is_empty() {
        sqlx::query(
            r#"
            INSERT INTO user_permissions (user_id, permission_id)
            SELECT $1, id FROM permissions WHERE code = ANY($2)
            "#,
        )
        .bind(id)
        .bind(grants)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(id)
}

/// Seed the first superadmin when the instance is empty and credentials are
/// configured; otherwise log what is missing.
pub async fn bootstrap_admin(pool: &PgPool, config: &crate::Config) -> SyncResult<()> {
    let live_users: i64 =
        sqlx::query("SELECT COUNT(*) AS n FROM users WHERE deleted_at IS NULL")
            .fetch_one(pool)
            .await?
            .try_get("n")?;
    if live_users > 0 {
        return Ok(());
    }

    match (&config.admin_username, &config.admin_password) {
        (Some(username), Some(password)) => {
            let id = create_user(pool, username, password, Role::Superadmin, &[]).await?;
            tracing::info!(%id, username, "bootstrapped initial superadmin");
        }
        _ => {
            tracing::warn!(
                "no users exist and OVH_ADMIN_USERNAME/OVH_ADMIN_PASSWORD are unset; \
                 logins will fail until an account is created"
            );
        }
    }
    Ok(())
}

fn parse_role(raw: String) -> SyncResult<Role> {
    Role::from_str(&raw)
        .map_err(|_| SyncError::internal(format!("users table holds unknown role {raw}")))
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = SyncError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SyncError::AuthRequired("missing authorization header".to_string()))?;
        authenticate(&state.pool, bearer).await
    }
}
