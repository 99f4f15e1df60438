pub mod admin;

use serenity::builder::CreateApplicationCommand;

/// Every slash command the bot registers
pub fn create_all_commands() -> Vec<CreateApplicationCommand> {
    admin::create_commands()
}
