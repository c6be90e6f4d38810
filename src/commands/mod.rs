pub mod adforum;
pub mod cfmod;
pub mod linkedroles;
pub mod namecollector;
pub mod steamwhitelist;
pub mod tracker;
pub mod tube;
pub mod twitch;

use crate::{Context, Data, Error};

/// Every command the bot registers.
pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![
        cfmod::cfmod(),
        tube::tube(),
        twitch::twitch(),
        linkedroles::linkedroles(),
        adforum::adforum(),
        steamwhitelist::steamid(),
        steamwhitelist::steamwhitelist(),
        namecollector::rolenamecollector(),
    ]
}

/// Reply visible only to the invoker, for anything touching secrets.
pub async fn say_private(ctx: Context<'_>, message: impl Into<String>) -> Result<(), Error> {
    ctx.send(
        poise::CreateReply::default()
            .content(message.into())
            .ephemeral(true),
    )
    .await?;
    Ok(())
}
