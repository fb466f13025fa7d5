//! Persisted user accounts.
//!
//! All methods block on storage and bcrypt; async callers should go through
//! `spawn_blocking`.

use crate::auth::AuthGateway;
use crate::error::{Result, ServerError};
use crate::storage::{get_record, put_record, user_key, GameDatabase};
use crate::utils::{get_unix_time, is_valid_username};
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserAccount {
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub created: u64,
    pub last_login: u64,
}

pub struct AccountStore {
    db: Arc<dyn GameDatabase>,
    auth: Arc<AuthGateway>,
    // Serializes the exists-check and the insert of a new account
    register_lock: Mutex<()>,
}

impl AccountStore {
    pub fn new(db: Arc<dyn GameDatabase>, auth: Arc<AuthGateway>) -> Self {
        Self {
            db,
            auth,
            register_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, username: &str) -> Result<Option<UserAccount>> {
        Ok(get_record(self.db.as_ref(), &user_key(username))?)
    }

    fn save(&self, account: &UserAccount) -> Result<()> {
        put_record(self.db.as_ref(), &user_key(&account.username), account)?;
        Ok(())
    }

    pub fn register(&self, username: &str, password: &str, email: &str) -> Result<UserAccount> {
        if username.is_empty() || password.is_empty() || email.is_empty() {
            return Err(ServerError::Validation(
                "username, password and email required".to_string(),
            ));
        }
        if !is_valid_username(username) {
            return Err(ServerError::Validation(format!(
                "username {:?} must be 1-32 letters, digits, '_' or '-'",
                username
            )));
        }
        if !email.contains('@') {
            return Err(ServerError::Validation(format!("{:?} is not an email address", email)));
        }

        let password_hash = self
            .auth
            .hash_password(password)
            .map_err(|e| ServerError::Internal(format!("password hashing failed: {}", e)))?;

        let _guard = self.register_lock.lock();
        if self.get(username)?.is_some() {
            info!("Registration failed because username {} is taken", username);
            return Err(ServerError::UsernameTaken(username.to_string()));
        }

        let now = get_unix_time();
        let account = UserAccount {
            username: username.to_string(),
            password_hash,
            email: email.to_string(),
            created: now,
            last_login: now,
        };
        self.save(&account)?;

        info!("Registered user {}", username);
        Ok(account)
    }

    /// Unknown users and wrong passwords both yield `InvalidCredentials`.
    pub fn login(&self, username: &str, password: &str) -> Result<UserAccount> {
        if username.is_empty() || password.is_empty() {
            return Err(ServerError::Validation(
                "username and password required".to_string(),
            ));
        }

        let mut account = match self.get(username)? {
            Some(account) => account,
            None => {
                info!("Login failed because user {} does not exist", username);
                return Err(ServerError::InvalidCredentials);
            }
        };

        if !self.auth.verify_password(password, &account.password_hash) {
            info!("Login failed for {}: wrong password", username);
            return Err(ServerError::InvalidCredentials);
        }

        account.last_login = get_unix_time();
        self.save(&account)?;

        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDatabase;
    use std::time::Duration;

    fn store() -> AccountStore {
        let auth = Arc::new(AuthGateway::new(b"secret", Duration::from_secs(60), 4));
        AccountStore::new(Arc::new(MemoryDatabase::new()), auth)
    }

    #[test]
    fn test_register_and_login() {
        let accounts = store();

        let created = accounts.register("alice", "pw", "alice@example.com").unwrap();
        assert_eq!(created.email, "alice@example.com");
        assert_ne!(created.password_hash, "pw");

        let logged_in = accounts.login("alice", "pw").unwrap();
        assert_eq!(logged_in.username, "alice");
        assert!(logged_in.last_login >= created.created);

        let stored = accounts.get("alice").unwrap().unwrap();
        assert_eq!(stored.last_login, logged_in.last_login);
    }

    #[test]
    fn test_username_taken() {
        let accounts = store();
        accounts.register("alice", "pw", "a@example.com").unwrap();

        let result = accounts.register("alice", "other", "b@example.com");
        assert!(matches!(result, Err(ServerError::UsernameTaken(name)) if name == "alice"));

        // First registration is untouched
        let stored = accounts.get("alice").unwrap().unwrap();
        assert_eq!(stored.email, "a@example.com");
    }

    #[test]
    fn test_missing_fields() {
        let accounts = store();

        for (user, pass, email) in [("", "pw", "a@b"), ("bob", "", "a@b"), ("bob", "pw", "")] {
            assert!(matches!(
                accounts.register(user, pass, email),
                Err(ServerError::Validation(_))
            ));
        }
        assert!(matches!(
            accounts.register("bob", "pw", "not-an-email"),
            Err(ServerError::Validation(_))
        ));
        assert!(accounts.get("bob").unwrap().is_none());
    }

    #[test]
    fn test_bad_credentials() {
        let accounts = store();
        accounts.register("alice", "pw", "a@example.com").unwrap();

        assert!(matches!(
            accounts.login("alice", "wrong"),
            Err(ServerError::InvalidCredentials)
        ));
        assert!(matches!(
            accounts.login("nobody", "pw"),
            Err(ServerError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_concurrent_registration_has_one_winner() {
        let accounts = Arc::new(store());

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let accounts = Arc::clone(&accounts);
                    s.spawn(move || accounts.register("dup", "pw", &format!("{}@example.com", i)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(ServerError::UsernameTaken(_))))
                .count(),
            3
        );
    }
}
