//! Reply channel names

/// Prefix shared by every generated reply channel
pub const REPLY_CHANNEL_PREFIX: &str = "replyChannel/";

/// Random characters after the prefix
const TOKEN_LEN: usize = 24;

/// Generate a one-shot reply channel name
///
/// The token comes from a v4 UUID, which carries more entropy than two
/// 12-character base36 draws.
pub fn generate_reply_channel() -> String {
    let mut token = uuid::Uuid::new_v4().simple().to_string();
    token.truncate(TOKEN_LEN);
    format!("{}{}", REPLY_CHANNEL_PREFIX, token)
}
