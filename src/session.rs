use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use dashmap::DashMap;

use crate::paths::RelPath;
use crate::protection::ProtectionRegistry;

pub const SESSION_COOKIE: &str = "fileshelf_session";
const SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Per-browser state: the view-hidden grant and the protected paths whose
/// key this session has presented.
#[derive(Debug, Clone, Default)]
pub struct Viewer {
    pub view_hidden: bool,
    grants: BTreeSet<RelPath>,
}

impl Viewer {
    pub fn grant(&mut self, path: RelPath) {
        self.grants.insert(path);
    }

    /// A grant opens `path` only if it sits between the governing protection
    /// entry and `path`, so an inner folder with its own key stays closed.
    pub fn can_open(&self, protection: &ProtectionRegistry, path: &RelPath) -> bool {
        match protection.governing(path) {
            None => true,
            Some((governing, _)) => self
                .grants
                .iter()
                .any(|grant| governing.contains(grant) && grant.contains(path)),
        }
    }
}

struct Session {
    viewer: Viewer,
    last_seen: Instant,
}

/// Sessions idle for longer than the ttl are dropped on the next new session.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Session>>,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_ttl(SESSION_TTL)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn viewer(&self, jar: &CookieJar) -> Viewer {
        let Some(cookie) = jar.get(SESSION_COOKIE) else {
            return Viewer::default();
        };
        match self.sessions.get_mut(cookie.value()) {
            Some(mut session) if session.last_seen.elapsed() <= self.ttl => {
                session.last_seen = Instant::now();
                session.viewer.clone()
            }
            _ => Viewer::default(),
        }
    }

    /// Mutate the caller's session, creating it (and its cookie) on first use.
    pub fn update<R>(&self, jar: CookieJar, f: impl FnOnce(&mut Viewer) -> R) -> (CookieJar, R) {
        let existing = jar
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .filter(|id| self.sessions.get(id).is_some_and(|s| s.last_seen.elapsed() <= self.ttl));
        let (jar, id) = match existing {
            Some(id) => (jar, id),
            None => {
                self.evict_expired();
                let id = nanoid::nanoid!(32);
                let cookie = Cookie::build((SESSION_COOKIE, id.clone()))
                    .path("/")
                    .http_only(true)
                    .same_site(SameSite::Lax);
                (jar.add(cookie), id)
            }
        };
        let mut entry = self.sessions.entry(id).or_insert_with(|| Session {
            viewer: Viewer::default(),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        let result = f(&mut entry.viewer);
        drop(entry);
        (jar, result)
    }

    fn evict_expired(&self) {
        let ttl = self.ttl;
        self.sessions.retain(|_, session| session.last_seen.elapsed() <= ttl);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rel(raw: &str) -> RelPath {
        RelPath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn grant_is_bounded_by_governing_entry() {
        let temp = TempDir::new().unwrap();
        let protection = ProtectionRegistry::open(temp.path().join("keys.json")).await;
        protection.set_protection(&rel("a"), "outer").await.unwrap();
        protection.set_protection(&rel("a/inner"), "inner").await.unwrap();

        let mut viewer = Viewer::default();
        assert!(!viewer.can_open(&protection, &rel("a/file.txt")));
        assert!(viewer.can_open(&protection, &rel("open/file.txt")));

        viewer.grant(rel("a"));
        assert!(viewer.can_open(&protection, &rel("a/file.txt")));
        assert!(!viewer.can_open(&protection, &rel("a/inner/file.txt")));

        viewer.grant(rel("a/inner"));
        assert!(viewer.can_open(&protection, &rel("a/inner/file.txt")));
    }

    #[test]
    fn update_issues_cookie_once() {
        let store = SessionStore::new();
        let (jar, _) = store.update(CookieJar::new(), |v| v.view_hidden = true);
        let id = jar.get(SESSION_COOKIE).unwrap().value().to_string();
        assert!(store.viewer(&jar).view_hidden);

        let (jar, now) = store.update(jar, |v| {
            v.view_hidden = !v.view_hidden;
            v.view_hidden
        });
        assert!(!now);
        assert_eq!(jar.get(SESSION_COOKIE).unwrap().value(), id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn idle_sessions_expire_and_are_evicted() {
        let store = SessionStore::with_ttl(Duration::ZERO);
        let (old, _) = store.update(CookieJar::new(), |v| v.view_hidden = true);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!store.viewer(&old).view_hidden);

        let (fresh, _) = store.update(CookieJar::new(), |_| ());
        assert_eq!(store.len(), 1);
        assert_ne!(
            fresh.get(SESSION_COOKIE).unwrap().value(),
            old.get(SESSION_COOKIE).unwrap().value()
        );
    }

    #[test]
    fn unknown_cookie_gets_fresh_session() {
        let store = SessionStore::new();
        let jar = CookieJar::new().add(Cookie::new(SESSION_COOKIE, "forged"));
        assert!(!store.viewer(&jar).view_hidden);
        let (jar, _) = store.update(jar, |_| ());
        assert_ne!(jar.get(SESSION_COOKIE).unwrap().value(), "forged");
    }
}
