//! Admin slash commands: /forum_analysis

use crate::forum_analysis::AnalysisRequest;
use serde_json::Value;
use serenity::builder::CreateApplicationCommand;
use serenity::model::application::command::CommandOptionType;
use serenity::model::permissions::Permissions;

pub const FORUM_ANALYSIS: &str = "forum_analysis";

/// Creates admin commands
pub fn create_commands() -> Vec<CreateApplicationCommand> {
    vec![create_forum_analysis_command()]
}

/// Creates the forum_analysis command (admin, guild only)
fn create_forum_analysis_command() -> CreateApplicationCommand {
    CreateApplicationCommand::default()
        .name(FORUM_ANALYSIS)
        .description("Analyse the forum for threads that meet a certain condition")
        .default_member_permissions(Permissions::ADMINISTRATOR)
        .dm_permission(false)
        .create_option(|option| {
            option
                .name("reaction_count")
                .description("The reaction count to filter by, defaults to 5")
                .kind(CommandOptionType::Integer)
                .required(false)
        })
        .create_option(|option| {
            option
                .name("message_count")
                .description("Only threads with at least this many messages are shown, defaults to 30")
                .kind(CommandOptionType::Integer)
                .required(false)
        })
        .create_option(|option| {
            option
                .name("condition")
                .description("Comma separated title words, prefix a word with - to exclude it")
                .kind(CommandOptionType::String)
                .required(false)
        })
        .create_option(|option| {
            option
                .name("use_cache")
                .description("Whether to use the cached threads, defaults to true")
                .kind(CommandOptionType::Boolean)
                .required(false)
        })
        .create_option(|option| {
            option
                .name("limit")
                .description("The number of threads to list, 0 for all, defaults to 10")
                .kind(CommandOptionType::Integer)
                .required(false)
        })
        .to_owned()
}

/// Build a forum analysis request from `(name, value)` option pairs.
///
/// Missing or mistyped options keep their defaults.
pub fn forum_analysis_request<'a, I>(options: I) -> AnalysisRequest
where
    I: IntoIterator<Item = (&'a str, Option<&'a Value>)>,
{
    let mut request = AnalysisRequest::default();
    for (name, value) in options {
        let value = match value {
            Some(value) => value,
            None => continue,
        };
        match name {
            "reaction_count" => {
                if let Some(v) = value.as_i64() {
                    request.reaction_count = v;
                }
            }
            "message_count" => {
                if let Some(v) = value.as_i64() {
                    request.message_count = v;
                }
            }
            "condition" => {
                if let Some(v) = value.as_str() {
                    request.condition = v.to_string();
                }
            }
            "use_cache" => {
                if let Some(v) = value.as_bool() {
                    request.use_cache = v;
                }
            }
            "limit" => {
                if let Some(v) = value.as_i64() {
                    request.limit = v;
                }
            }
            _ => {}
        }
    }
    request
}
