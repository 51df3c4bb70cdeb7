use rand::Rng;

/// Token space: eight decimal digits.
const SESSION_ID_SPACE: u32 = 100_000_000;

/// Generate a fresh session token.
///
/// Tokens are short decimal strings drawn uniformly at random. A new token is
/// produced per credential resolution and never cached, so distinct
/// upstream-bound attempts carry distinct tokens with overwhelming
/// probability.
pub fn new_session_id() -> String {
    rand::thread_rng().gen_range(0..SESSION_ID_SPACE).to_string()
}
