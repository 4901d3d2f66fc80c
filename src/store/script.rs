//! Server-side scripts
//!
//! The engine's only server-side coordination is the compare-and-swap
//! version bump below. Argument order is part of the wire contract:
//! `ARGV = [expected_previous, desired, on_mismatch, ttl_millis]`, where an
//! empty `expected_previous` means "no previous version expected" and a
//! `ttl_millis` of 0 means no expiry.

use once_cell::sync::Lazy;

/// Lua body of the version compare-and-swap.
pub const CAS_SCRIPT_BODY: &str = r#"
local actual = redis.call('GET', KEYS[1])
local expected = ARGV[1]
local new_version
if (actual == false and expected == '') or actual == expected then
  new_version = ARGV[2]
else
  new_version = ARGV[3]
end
local ttl = tonumber(ARGV[4])
if ttl ~= nil and ttl > 0 then
  redis.call('SET', KEYS[1], new_version, 'PX', ttl)
else
  redis.call('SET', KEYS[1], new_version)
end
return new_version
"#;

/// The version compare-and-swap script.
pub static CAS_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(CAS_SCRIPT_BODY));

/// A script body together with its SHA1 hash as the server computes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    body: String,
    sha: String,
}

impl Script {
    pub fn new(body: &str) -> Self {
        let sha = ::redis::Script::new(body).get_hash().to_string();
        Self {
            body: body.to_string(),
            sha,
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn sha(&self) -> &str {
        &self.sha
    }
}
