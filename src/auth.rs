//! Credential backend used by the auth filter
//!
//! `Users` is an in-memory user and group store. Anything else (a password
//! file, an external directory) can be plugged in by implementing
//! `AuthBackend` and passing it to `ServerContext::set_auth_backend`.
use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::config::AuthConfig;


/// Access control list, a bit per permission
pub type Acl = u64;

pub trait AuthBackend: Send + Sync {
    /// Password required for the user, `None` if there is no such user
    fn get_password(&self, realm: &str, user: &str) -> Option<String>;
    fn validate_credentials(&self, _realm: &str, _user: &str,
                            supplied: &str, required: &str)
        -> bool
    {
        supplied == required
    }
    /// Checks user and group restrictions of the location
    fn authorize(&self, _realm: &str, user: &str, config: &AuthConfig)
        -> bool
    {
        config.users.is_empty() || config.users.iter().any(|u| u == user)
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub realm: String,
    pub password: String,
    pub enabled: bool,
    pub acl: Acl,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub enabled: bool,
    pub acl: Acl,
    pub members: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Users {
    users: HashMap<(String, String), User>,
    groups: HashMap<String, Group>,
}

impl Users {
    pub fn new() -> Users {
        Users::default()
    }
    pub fn add_user(&mut self, realm: &str, name: &str, password: &str) {
        self.users.insert((realm.into(), name.into()), User {
            name: name.into(),
            realm: realm.into(),
            password: password.into(),
            enabled: true,
            acl: 0,
        });
    }
    pub fn remove_user(&mut self, realm: &str, name: &str) -> Option<User> {
        self.users.remove(&(realm.to_string(), name.to_string()))
    }
    pub fn user(&self, realm: &str, name: &str) -> Option<&User> {
        self.users.get(&(realm.to_string(), name.to_string()))
    }
    pub fn set_user_enabled(&mut self, realm: &str, name: &str,
                            enabled: bool)
    {
        let key = (realm.to_string(), name.to_string());
        if let Some(u) = self.users.get_mut(&key) {
            u.enabled = enabled;
        }
    }
    pub fn add_group(&mut self, name: &str, acl: Acl) {
        self.groups.insert(name.into(), Group {
            name: name.into(),
            enabled: true,
            acl,
            members: Vec::new(),
        });
    }
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }
    pub fn add_user_to_group(&mut self, group: &str, user: &str) -> bool {
        match self.groups.get_mut(group) {
            Some(g) => {
                if !g.members.iter().any(|m| m == user) {
                    g.members.push(user.into());
                }
                true
            }
            None => false,
        }
    }
    pub fn remove_user_from_group(&mut self, group: &str, user: &str) {
        if let Some(g) = self.groups.get_mut(group) {
            g.members.retain(|m| m != user);
        }
    }
    pub fn is_user_in_group(&self, group: &str, user: &str) -> bool {
        self.groups.get(group)
            .map_or(false, |g| g.enabled && g.members.iter().any(|m| m == user))
    }
    /// Recomputes every user's ACL as the union of the ACLs of the enabled
    /// groups listing the user as a member
    pub fn update_user_acls(&mut self) {
        for user in self.users.values_mut() {
            user.acl = self.groups.values()
                .filter(|g| g.enabled)
                .filter(|g| g.members.iter().any(|m| *m == user.name))
                .fold(0, |acl, g| acl | g.acl);
        }
    }
}

impl AuthBackend for Users {
    fn get_password(&self, realm: &str, user: &str) -> Option<String> {
        self.user(realm, user)
            .filter(|u| u.enabled)
            .map(|u| u.password.clone())
    }
    fn authorize(&self, _realm: &str, user: &str, config: &AuthConfig)
        -> bool
    {
        if !config.users.is_empty() && !config.users.iter().any(|u| u == user)
        {
            return false;
        }
        config.groups.is_empty()
            || config.groups.iter().any(|g| self.is_user_in_group(g, user))
    }
}

/// Decodes credentials of the `Basic` authorization scheme
pub fn decode_basic(details: &str) -> Option<(String, String)> {
    let bytes = STANDARD.decode(details.trim()).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    let mut pair = text.splitn(2, ':');
    let user = pair.next()?.to_string();
    let password = pair.next()?.to_string();
    Some((user, password))
}

#[cfg(test)]
mod test {
    use crate::config::AuthConfig;
    use super::{AuthBackend, Users, decode_basic};

    fn store() -> Users {
        let mut users = Users::new();
        users.add_user("site", "alice", "secret");
        users.add_user("site", "bob", "hunter2");
        users.add_group("admins", 0b0011);
        users.add_group("editors", 0b0100);
        users.add_group("nobody", 0b1000);
        users.add_user_to_group("admins", "alice");
        users.add_user_to_group("editors", "alice");
        users.add_user_to_group("editors", "bob");
        users
    }

    #[test]
    fn acls_are_union_of_member_groups() {
        let mut users = store();
        users.update_user_acls();
        assert_eq!(users.user("site", "alice").unwrap().acl, 0b0111);
        assert_eq!(users.user("site", "bob").unwrap().acl, 0b0100);
        users.remove_user_from_group("editors", "bob");
        users.update_user_acls();
        assert_eq!(users.user("site", "bob").unwrap().acl, 0);
    }

    #[test]
    fn passwords() {
        let mut users = store();
        assert_eq!(users.get_password("site", "alice").as_deref(),
                   Some("secret"));
        assert_eq!(users.get_password("other", "alice"), None);
        users.set_user_enabled("site", "alice", false);
        assert_eq!(users.get_password("site", "alice"), None);
        assert!(users.validate_credentials("site", "bob", "x", "x"));
        assert!(!users.validate_credentials("site", "bob", "x", "y"));
    }

    #[test]
    fn group_restrictions() {
        let users = store();
        let mut config = AuthConfig::default();
        config.groups.push("admins".into());
        assert!(users.authorize("site", "alice", &config));
        assert!(!users.authorize("site", "bob", &config));
        config.groups.clear();
        config.users.push("bob".into());
        assert!(!users.authorize("site", "alice", &config));
    }

    #[test]
    fn basic_credentials() {
        assert_eq!(decode_basic("YWxhZGRpbjpvcGVuc2VzYW1l"),
                   Some(("aladdin".into(), "opensesame".into())));
        assert_eq!(decode_basic("!!!"), None);
        // no colon
        assert_eq!(decode_basic("YWxhZGRpbg=="), None);
    }
}
