//! Identity, roles and page access.
//!
//! Who a user is comes from an [`IdentityProvider`]; what they may see is
//! decided by [`RolePolicy`] and [`gate`]. The local session cache is only a
//! convenience for front-ends and is never read when deciding access.

use anyhow::{Context, Result, anyhow, bail};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Viewer,
}

/// Identity facts handed over by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub uid: String,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub claims: Claims,
    pub role: Role,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Default)]
pub struct RolePolicy {
    admin_emails: Vec<String>,
}

impl RolePolicy {
    pub fn new<I, S>(admin_emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            admin_emails: admin_emails
                .into_iter()
                .map(|e| e.as_ref().trim().to_lowercase())
                .collect(),
        }
    }

    pub fn resolve(&self, claims: &Claims) -> Role {
        let email = claims.email.trim().to_lowercase();
        if self.admin_emails.iter().any(|a| *a == email) {
            Role::Admin
        } else {
            Role::Viewer
        }
    }

    pub fn session(&self, claims: Claims) -> Session {
        let role = self.resolve(&claims);
        Session { claims, role }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Page {
    Index,
    Login,
    Register,
    Dashboard,
    Admin,
}

impl std::str::FromStr for Page {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_end_matches(".html") {
            "" | "index" => Ok(Page::Index),
            "login" => Ok(Page::Login),
            "register" => Ok(Page::Register),
            "dashboard" => Ok(Page::Dashboard),
            "admin" => Ok(Page::Admin),
            other => Err(anyhow!("Unknown page: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "access", rename_all = "lowercase")]
pub enum Access {
    Allow,
    Redirect {
        to: Page,
        notice: Option<&'static str>,
    },
}

/// Decide whether `session` may view `page`.
pub fn gate(page: Page, session: Option<&Session>) -> Access {
    match (page, session) {
        (Page::Dashboard | Page::Admin, None) => Access::Redirect {
            to: Page::Login,
            notice: Some("Debes iniciar sesión para acceder."),
        },
        (Page::Admin, Some(s)) if !s.is_admin() => Access::Redirect {
            to: Page::Dashboard,
            notice: Some("Acceso denegado. Solo el administrador puede acceder."),
        },
        (Page::Login | Page::Register, Some(_)) => Access::Redirect {
            to: Page::Dashboard,
            notice: None,
        },
        _ => Access::Allow,
    }
}

/// Where a user lands right after signing in.
pub fn landing_page(session: &Session) -> Page {
    if session.is_admin() { Page::Admin } else { Page::Dashboard }
}

pub trait IdentityProvider: Send + Sync {
    fn sign_up(&self, name: &str, email: &str, password: &str) -> Result<Session>;

    fn sign_in(&self, email: &str, password: &str) -> Result<Session>;

    fn list_users(&self) -> Result<Vec<UserProfile>>;
}

/// Public part of a user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub uid: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredUser {
    #[serde(flatten)]
    profile: UserProfile,
    password_hash: String,
}

/// Users kept in a JSON file with argon2 password hashes.
pub struct LocalIdentityProvider {
    path: PathBuf,
    policy: RolePolicy,
    lock: Mutex<()>,
}

impl LocalIdentityProvider {
    pub fn new(path: impl Into<PathBuf>, policy: RolePolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<StoredUser>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read users file: {:?}", self.path))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse users file: {:?}", self.path))
    }

    fn save(&self, users: &[StoredUser]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(users)?)
            .with_context(|| format!("Failed to write users file: {:?}", self.path))
    }

    fn session_for(&self, profile: &UserProfile) -> Session {
        self.policy.session(Claims {
            uid: profile.uid.clone(),
            email: profile.email.clone(),
            display_name: profile.name.clone(),
        })
    }
}

impl IdentityProvider for LocalIdentityProvider {
    fn sign_up(&self, name: &str, email: &str, password: &str) -> Result<Session> {
        let email = email.trim();
        if !email.contains('@') {
            bail!("Correo inválido: {}", email);
        }
        if password.len() < 6 {
            bail!("La contraseña debe tener al menos 6 caracteres");
        }

        let _guard = self.lock.lock().map_err(|_| anyhow!("users lock poisoned"))?;
        let mut users = self.load()?;
        if users.iter().any(|u| u.profile.email.eq_ignore_ascii_case(email)) {
            bail!("Ya existe una cuenta con el correo {}", email);
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow!("Failed to hash password: {}", e))?
            .to_string();

        let uid = uuid::Uuid::new_v4().to_string();
        let claims = Claims {
            uid: uid.clone(),
            email: email.to_string(),
            display_name: if name.trim().is_empty() { "Usuario".to_string() } else { name.trim().to_string() },
        };
        let role = self.policy.resolve(&claims);
        let profile = UserProfile {
            uid,
            email: claims.email.clone(),
            name: claims.display_name.clone(),
            role,
            created_at: Utc::now(),
        };
        users.push(StoredUser { profile: profile.clone(), password_hash });
        self.save(&users)?;

        info!(email = %profile.email, role = ?role, "user registered");
        Ok(self.session_for(&profile))
    }

    fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let users = self.load()?;
        let user = users
            .iter()
            .find(|u| u.profile.email.eq_ignore_ascii_case(email.trim()))
            .ok_or_else(|| anyhow!("Credenciales inválidas"))?;

        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|e| anyhow!("Corrupt password hash for {}: {}", user.profile.email, e))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| anyhow!("Credenciales inválidas"))?;

        Ok(self.session_for(&user.profile))
    }

    fn list_users(&self) -> Result<Vec<UserProfile>> {
        Ok(self.load()?.into_iter().map(|u| u.profile).collect())
    }
}

/// Browser-local style cache of who is signed in: `{uid, email, displayName}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedUser {
    pub uid: String,
    pub email: String,
    pub display_name: String,
}

pub struct SessionCache {
    path: PathBuf,
}

impl SessionCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let cached = CachedUser {
            uid: session.claims.uid.clone(),
            email: session.claims.email.clone(),
            display_name: session.claims.display_name.clone(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string(&cached)?)
            .with_context(|| format!("Failed to write session cache: {:?}", self.path))
    }

    /// Unreadable or missing cache is just "nobody cached".
    pub fn load(&self) -> Option<CachedUser> {
        let content = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to clear session cache: {:?}", self.path)),
        }
    }
}
