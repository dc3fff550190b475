use crate::db::Database;
use crate::error::Error;
use crate::types::{ItemType, ParseMode};

/// Story renderings list at most this many member headlines.
const STORY_MEMBER_LIMIT: i64 = 5;

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// MarkdownV2 reserves most ASCII punctuation; unescaped occurrences make
// the channel reject the whole message.
fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(
            ch,
            '_' | '*'
                | '['
                | ']'
                | '('
                | ')'
                | '~'
                | '`'
                | '>'
                | '#'
                | '+'
                | '-'
                | '='
                | '|'
                | '{'
                | '}'
                | '.'
                | '!'
                | '\\'
        ) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn escape(text: &str, mode: ParseMode) -> String {
    match mode {
        ParseMode::Html => escape_html(text),
        ParseMode::Markdown => escape_markdown(text),
    }
}

/// Builds the outgoing message body for a queue item.
pub async fn render_item(
    db: &Database,
    item_type: ItemType,
    item_id: i64,
    mode: ParseMode,
) -> Result<String, Error> {
    match item_type {
        ItemType::Article => render_article(db, item_id, mode).await,
        ItemType::Story => render_story(db, item_id, mode).await,
    }
}

async fn render_article(db: &Database, news_id: i64, mode: ParseMode) -> Result<String, Error> {
    let row = db
        .get_article(news_id)
        .await?
        .ok_or_else(|| Error::Validation(format!("article {} not found", news_id)))?;

    let mut text = match mode {
        ParseMode::Html => format!("<b>{}</b>", escape_html(&row.title)),
        ParseMode::Markdown => format!("*{}*", escape_markdown(&row.title)),
    };
    if let Some(url) = row.url.as_deref().filter(|u| !u.is_empty()) {
        text.push('\n');
        text.push_str(&escape(url, mode));
    }
    Ok(text)
}

async fn render_story(db: &Database, story_id: i64, mode: ParseMode) -> Result<String, Error> {
    let row = db
        .get_story(story_id)
        .await?
        .ok_or_else(|| Error::Validation(format!("story {} not found", story_id)))?;

    let members = db.story_members(story_id, STORY_MEMBER_LIMIT).await?;
    let total = db.count_story_members(story_id).await?;

    let mut text = match mode {
        ParseMode::Html => format!("<b>{}</b>", escape_html(&row.title)),
        ParseMode::Markdown => format!("*{}*", escape_markdown(&row.title)),
    };
    for (index, member) in members.iter().enumerate() {
        let separator = match mode {
            ParseMode::Html => ".",
            ParseMode::Markdown => "\\.",
        };
        text.push_str(&format!(
            "\n{}{} {}",
            index + 1,
            separator,
            escape(&member.title, mode)
        ));
    }
    let shown = members.len() as i64;
    if total > shown {
        text.push_str(&format!("\n{} more", escape(&format!("+{}", total - shown), mode)));
    }
    Ok(text)
}
