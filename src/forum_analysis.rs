//! # Feature: Forum Analysis
//!
//! Ranks the bug-report threads of a forum channel by activity. A bug thread
//! carries the bug tag, not the patched tag, and is neither locked nor pinned.
//! It makes the ranking when the first reaction on its starter message reaches
//! the reaction threshold, or failing that when its message count reaches the
//! message threshold (ranked with zero reactions).
//!
//! Results are posted to the configured target channel: a stats block, then a
//! progress message that is edited into the final "Bug Report Stats" embed.

use crate::config::{parse_id, ForumAnalysisConfig};
use crate::platform::{ChatPlatform, OutgoingMessage, PlatformResult, ThreadInfo};
use crate::templates::EmbedTemplate;
use anyhow::Result;
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Embed descriptions are capped at 4096 characters
pub const EMBED_DESCRIPTION_LIMIT: usize = 4096;

const PROGRESS_EVERY: usize = 10;
const REPORT_TITLE: &str = "Bug Report Stats";

/// Raw options of the slash command, before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub reaction_count: i64,
    pub message_count: i64,
    pub condition: String,
    pub use_cache: bool,
    pub limit: i64,
}

impl Default for AnalysisRequest {
    fn default() -> Self {
        AnalysisRequest {
            reaction_count: 5,
            message_count: 30,
            condition: String::new(),
            use_cache: true,
            limit: 10,
        }
    }
}

/// Validated analysis parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisParams {
    pub min_reactions: u64,
    pub min_messages: u64,
    pub condition: String,
    pub use_cache: bool,
    /// `None` means no limit
    pub limit: Option<usize>,
}

impl AnalysisRequest {
    /// Reject negative numbers with the message shown to the user
    pub fn validate(&self) -> std::result::Result<AnalysisParams, String> {
        if self.reaction_count < 0 || self.message_count < 0 || self.limit < 0 {
            return Err(format!(
                "Invalid arguments, reaction_count={}, message_count={}, limit={}",
                self.reaction_count, self.message_count, self.limit
            ));
        }
        Ok(AnalysisParams {
            min_reactions: self.reaction_count as u64,
            min_messages: self.message_count as u64,
            condition: self.condition.trim().to_string(),
            use_cache: self.use_cache,
            limit: if self.limit == 0 {
                None
            } else {
                Some(self.limit as usize)
            },
        })
    }
}

impl AnalysisParams {
    /// Footer text describing the filter
    pub fn describe(&self) -> String {
        let title = if self.condition.is_empty() {
            String::new()
        } else {
            format!("title: {} AND ", self.condition)
        };
        format!(
            "filtered by [ {}(reaction >= {} OR messages >= {}) ]",
            title, self.min_reactions, self.min_messages
        )
    }
}

/// Forum ids, parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForumSettings {
    pub forum_channel_id: u64,
    pub target_channel_id: u64,
    pub bug_tag_id: u64,
    pub patched_tag_id: u64,
}

impl ForumSettings {
    pub fn from_config(config: &ForumAnalysisConfig) -> Result<Self> {
        Ok(ForumSettings {
            forum_channel_id: parse_id("forum_channel_id", &config.forum_channel_id)?,
            target_channel_id: parse_id("target_channel_id", &config.target_channel_id)?,
            bug_tag_id: parse_id("bug_tag_id", &config.bug_tag_id)?,
            patched_tag_id: parse_id("patched_tag_id", &config.patched_tag_id)?,
        })
    }
}

/// One ranked thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedThread {
    pub reactions: u64,
    pub thread: ThreadInfo,
}

impl RankedThread {
    pub fn report_line(&self) -> String {
        format!(
            "> {} : **{}** ⬆️, **{}** msgs",
            self.thread.mention(),
            self.reactions,
            self.thread.message_count
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisReport {
    pub total_threads: usize,
    pub bug_threads: usize,
    pub ranked: Vec<RankedThread>,
}

pub struct ForumAnalyser {
    platform: Arc<dyn ChatPlatform>,
    guild_id: u64,
    settings: ForumSettings,
    threads: Mutex<Vec<ThreadInfo>>,
}

impl ForumAnalyser {
    pub fn new(platform: Arc<dyn ChatPlatform>, guild_id: u64, settings: ForumSettings) -> Self {
        ForumAnalyser {
            platform,
            guild_id,
            settings,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &ForumSettings {
        &self.settings
    }

    /// The command only runs in the target channel
    pub fn check_channel(&self, channel_id: u64) -> std::result::Result<(), String> {
        if channel_id == self.settings.target_channel_id {
            Ok(())
        } else {
            Err(format!(
                "Can only be used in <#{}>",
                self.settings.target_channel_id
            ))
        }
    }

    async fn threads(&self, use_cache: bool) -> PlatformResult<Vec<ThreadInfo>> {
        let mut cache = self.threads.lock().await;
        if cache.is_empty() || !use_cache {
            *cache = self
                .platform
                .forum_threads(self.guild_id, self.settings.forum_channel_id)
                .await?;
            info!("[forum_analysis] Got {} threads", cache.len());
        }
        Ok(cache.clone())
    }

    /// Run the analysis and post its results to the target channel
    pub async fn run(&self, params: &AnalysisParams) -> PlatformResult<AnalysisReport> {
        let target = self.settings.target_channel_id;
        let mut threads = self.threads(params.use_cache).await?;
        if threads.first().map(|t| t.pinned).unwrap_or(false) {
            threads.remove(0);
        }

        let (latest, first) = match (threads.first(), threads.last()) {
            (Some(latest), Some(first)) => (latest.mention(), first.mention()),
            _ => {
                self.platform
                    .send_message(target, &text("No threads found in the forum"))
                    .await?;
                return Ok(AnalysisReport {
                    total_threads: 0,
                    bug_threads: 0,
                    ranked: Vec::new(),
                });
            }
        };
        let stats = [
            "> Stats :".to_string(),
            format!("> Total Threads : {}", threads.len()),
            format!("> Latest Thread : {}", latest),
            format!("> First Thread : {}", first),
        ];
        self.platform.send_message(target, &text(&stats.join("\n"))).await?;

        let progress = self
            .platform
            .send_message(target, &text("Generating bug report stats..."))
            .await?;

        let bugs: Vec<&ThreadInfo> = threads
            .iter()
            .filter(|t| is_valid_bug_thread(t, self.settings.bug_tag_id, self.settings.patched_tag_id))
            .collect();
        self.platform
            .edit_message(
                target,
                progress,
                &text(&format!("Found {} threads that are bug reports", bugs.len())),
            )
            .await?;

        let mut ranked = Vec::new();
        let mut processed = 0;
        for thread in &bugs {
            if !params.condition.is_empty() && !title_passes_condition(&thread.name, &params.condition) {
                debug!(
                    "[forum_analysis] Thread {} failed the '{}' condition",
                    thread.name, params.condition
                );
                continue;
            }

            let reactions = match self.platform.starter_reaction_count(thread.id).await? {
                Some(reactions) => reactions,
                None => {
                    warn!(
                        "[forum_analysis] Thread {}:{} has no starting message",
                        thread.name, thread.id
                    );
                    continue;
                }
            };

            if reactions > 0 && reactions >= params.min_reactions {
                ranked.push(RankedThread {
                    reactions,
                    thread: (*thread).clone(),
                });
            } else if thread.message_count >= params.min_messages {
                ranked.push(RankedThread {
                    reactions: 0,
                    thread: (*thread).clone(),
                });
            } else {
                trace!("[forum_analysis] Thread {}:{} has too little activity", thread.name, thread.id);
            }

            processed += 1;
            if processed % PROGRESS_EVERY == 0 {
                self.platform
                    .edit_message(
                        target,
                        progress,
                        &text(&format!(
                            "Generating bug report stats...Processed {}/{} threads",
                            processed,
                            bugs.len()
                        )),
                    )
                    .await?;
            }
        }

        // Stable sort keeps the forum order among equal counts
        ranked.sort_by(|a, b| b.reactions.cmp(&a.reactions));
        if let Some(limit) = params.limit {
            ranked.truncate(limit);
        }

        let lines: Vec<String> = ranked.iter().map(RankedThread::report_line).collect();
        let timestamp = chrono::Utc::now().to_rfc3339();
        let footer = params.describe();
        let mut pages = report_pages(&lines).into_iter();

        let first_page = pages.next().unwrap_or_default();
        self.platform
            .edit_message(
                target,
                progress,
                &OutgoingMessage {
                    content: None,
                    embeds: vec![report_embed(REPORT_TITLE, first_page, &footer, &timestamp)],
                    buttons: Vec::new(),
                },
            )
            .await?;

        for page in pages {
            let title = format!("{} (continued)", REPORT_TITLE);
            self.platform
                .send_message(
                    target,
                    &OutgoingMessage {
                        content: None,
                        embeds: vec![report_embed(&title, page, &footer, &timestamp)],
                        buttons: Vec::new(),
                    },
                )
                .await?;
        }

        info!(
            "[forum_analysis] Ranked {} of {} bug threads",
            ranked.len(),
            bugs.len()
        );
        Ok(AnalysisReport {
            total_threads: threads.len(),
            bug_threads: bugs.len(),
            ranked,
        })
    }
}

fn text(content: &str) -> OutgoingMessage {
    OutgoingMessage {
        content: Some(content.to_string()),
        ..Default::default()
    }
}

fn report_embed(title: &str, description: String, footer: &str, timestamp: &str) -> EmbedTemplate {
    EmbedTemplate {
        title: Some(title.to_string()),
        description: Some(description),
        footer: Some(footer.to_string()),
        timestamp: Some(timestamp.to_string()),
        ..Default::default()
    }
}

/// Check a thread title against a comma separated condition.
///
/// `-word` excludes titles containing the word, every other word must be
/// present. Words are matched against the lower-cased, whitespace-split title.
pub fn title_passes_condition(title: &str, condition: &str) -> bool {
    let title = title.to_lowercase();
    let words: Vec<&str> = title.split_whitespace().collect();
    let condition = condition.to_lowercase();

    let mut exclusions = Vec::new();
    let mut inclusions = Vec::new();
    for part in condition.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.strip_prefix('-') {
            Some(word) => exclusions.push(word.trim()),
            None => inclusions.push(part),
        }
    }

    if exclusions.iter().any(|word| words.contains(word)) {
        return false;
    }
    inclusions.iter().all(|word| words.contains(word))
}

pub fn is_valid_bug_thread(thread: &ThreadInfo, bug_tag_id: u64, patched_tag_id: u64) -> bool {
    if thread.locked || thread.pinned || thread.has_tag(patched_tag_id) {
        return false;
    }
    thread.has_tag(bug_tag_id)
}

/// Join report lines until the next one would reach the embed limit.
///
/// Returns the joined report and the lines that did not fit.
pub fn make_report_safe_for_embed(parts: &[String]) -> (String, &[String]) {
    let mut report = String::new();
    let mut length = 0;
    for (index, part) in parts.iter().enumerate() {
        let part_length = part.chars().count() + 1;
        if length + part_length >= EMBED_DESCRIPTION_LIMIT {
            return (report, &parts[index..]);
        }
        report.push('\n');
        report.push_str(part);
        length += part_length;
    }
    (report, &[])
}

/// Split report lines into embed-sized pages
pub fn report_pages(parts: &[String]) -> Vec<String> {
    let mut pages = Vec::new();
    let mut rest = parts;
    while !rest.is_empty() {
        let (page, remaining) = make_report_safe_for_embed(rest);
        if remaining.len() == rest.len() {
            // A single line too long for an embed
            let line: String = rest[0].chars().take(EMBED_DESCRIPTION_LIMIT - 1).collect();
            pages.push(line);
            rest = &rest[1..];
            continue;
        }
        pages.push(page);
        rest = remaining;
    }
    if pages.is_empty() {
        pages.push(String::new());
    }
    pages
}
