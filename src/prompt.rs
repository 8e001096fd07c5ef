//! Task prompt preparation: ground rules for the agent and repair of a
//! common caller typo where a URL and the word "and" are glued together.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

/// System prompt shared by all model backends.
pub const SYSTEM_PROMPT: &str = "You are a browser automation agent driving a real browser one action \
at a time. Each turn you receive the task, the transcript so far, and the current page state \
(URL, title, and a numbered list of interactive elements). Choose exactly ONE action per turn. \
Only reference element indices that appear in the current list — they are invalidated by every \
navigation and click. When the task is complete, finish with the `done` action and put the \
requested data in its summary. If an action failed last turn, try a different approach instead \
of repeating it.";

/// Prepare the caller's task prompt for the agent: fix glued-URL typos and
/// attach the standing extraction rule.
pub fn wrap_task(task: &str) -> String {
    let task = repair_glued_and(task);
    format!(
        "{}\n\nWhen extracting data from the page, scroll content into view before reading it, \
and report absolute URLs.",
        task.trim()
    )
}

/// English words that legitimately end in "and"; never truncated.
fn real_and_words() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| {
        [
            "command", "demand", "expand", "understand", "withstand",
            "contraband", "headband", "armband", "remand", "reprimand",
            "mainland", "farmland", "highland", "lowland", "island",
            "strand", "brand", "grand", "stand", "sand", "hand",
            "land", "band", "wand", "bland", "gland", "planned",
            "scanned", "fanned", "manned", "spanned", "banned",
            "canned", "tanned", "panned",
        ]
        .into_iter()
        .collect()
    })
}

/// Strip a trailing "and" glued onto a URL path without a space, e.g.
/// "https://host/reportsand click" -> "https://host/reports and click".
/// A word blocklist avoids mangling real English words like "command".
pub fn repair_glued_and(text: &str) -> String {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    static TAIL_RE: OnceLock<Regex> = OnceLock::new();
    let url_re = URL_RE.get_or_init(|| Regex::new(r"https?://\S+").unwrap());
    let tail_re = TAIL_RE.get_or_init(|| Regex::new(r"([a-z]{4,}and)$").unwrap());

    url_re
        .replace_all(text, |caps: &regex::Captures| {
            let url = &caps[0];
            match tail_re.captures(url) {
                Some(tail) if !real_and_words().contains(tail[1].to_lowercase().as_str()) => {
                    format!("{} and", &url[..url.len() - 3])
                }
                _ => url.to_string(),
            }
        })
        .into_owned()
}
