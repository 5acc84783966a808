/// Longest text a single Telegram message may carry.
pub const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Cuts at the last newline inside the window, falling back to the last
/// space, and only breaks a word when neither exists. Whitespace at the cut
/// is dropped; blank chunks are never produced.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        let Some((window_end, _)) = rest.char_indices().nth(max_chars) else {
            chunks.push(rest.to_string());
            break;
        };

        let window = &rest[..window_end];
        let (chunk, next) = match window.rfind('\n').or_else(|| window.rfind(' ')) {
            Some(cut) if cut > 0 => (&rest[..cut], &rest[cut + 1..]),
            _ => (window, &rest[window_end..]),
        };

        let chunk = chunk.trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        rest = next.trim_start();
    }

    chunks
}
