use async_trait::async_trait;
use serde_json::json;

use chainview_core::challenge::ChallengeEvent;
use chainview_core::entity::{Action, EntityType, EntityWrite, ManageEntity};
use chainview_core::error::TxError;

use crate::handler::{merge_fields, EntityHandler, TxContext, TxEffects};

/// Fields a signer can never set on their own profile.
const PROTECTED_FIELDS: [&str; 3] = ["user_id", "is_verified", "cid"];

/// User creation, profile updates, verification and tips.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserHandler;

#[async_trait]
impl EntityHandler for UserHandler {
    fn name(&self) -> &'static str {
        "user"
    }

    fn routes(&self) -> Vec<(EntityType, Action)> {
        [Action::Create, Action::Update, Action::Verify, Action::Tip]
            .into_iter()
            .map(|a| (EntityType::User, a))
            .collect()
    }

    async fn handle(&self, ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
        match tx.action {
            Action::Create => create(ctx, tx).await,
            Action::Update => update(ctx, tx).await,
            Action::Verify => verify(ctx, tx).await,
            Action::Tip => tip(ctx, tx).await,
            other => Err(TxError::invalid(format!("User does not support {other}"))),
        }
    }
}

async fn create(ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
    let user_id = tx.entity_id;
    if tx.user_id != user_id {
        return Err(TxError::invalid(format!("signer {} cannot create user {user_id}", tx.user_id)));
    }
    if ctx.current(EntityType::User, &user_id.to_string()).await?.is_some() {
        return Err(TxError::invalid(format!("user {user_id} already exists")));
    }

    let mut metadata = ctx.resolve_metadata(tx).await?;
    for field in PROTECTED_FIELDS {
        metadata.remove(field);
    }
    let referrer = metadata.get("referrer").and_then(|v| v.as_u64());
    metadata.insert("user_id".into(), json!(user_id));

    let mut effects = TxEffects::new().write(EntityWrite::upsert(
        EntityType::User,
        user_id.to_string(),
        serde_json::Value::Object(metadata),
    ));

    // An unknown referrer does not invalidate the signup, it just earns nothing.
    if let Some(referrer) = referrer.filter(|r| *r != user_id) {
        if ctx.live(EntityType::User, &referrer.to_string()).await?.is_some() {
            effects = effects
                .emit(ChallengeEvent::ReferralSignup, referrer, json!({ "referred_user_id": user_id }))
                .emit(ChallengeEvent::ReferredSignup, user_id, json!({ "referrer_user_id": referrer }));
        }
    }
    Ok(effects)
}

async fn update(ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
    let user_id = tx.entity_id;
    if tx.user_id != user_id {
        return Err(TxError::invalid(format!("signer {} cannot update user {user_id}", tx.user_id)));
    }
    let existing = ctx.require_live(EntityType::User, user_id).await?;

    let mut metadata = ctx.resolve_metadata(tx).await?;
    for field in PROTECTED_FIELDS {
        metadata.remove(field);
    }
    let first_mobile = metadata.get("is_mobile_user").and_then(|v| v.as_bool()) == Some(true)
        && !existing.field_bool("is_mobile_user");

    let mut effects = TxEffects::new()
        .write(EntityWrite::upsert(
            EntityType::User,
            user_id.to_string(),
            merge_fields(&existing.fields, metadata),
        ))
        .emit(ChallengeEvent::ProfileUpdate, user_id, json!({}));
    if first_mobile {
        effects = effects.emit(ChallengeEvent::MobileInstall, user_id, json!({}));
    }
    Ok(effects)
}

async fn verify(ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
    if !ctx.config.is_verifier(tx.user_id) {
        return Err(TxError::invalid(format!("signer {} is not a verifier", tx.user_id)));
    }
    let existing = ctx.require_live(EntityType::User, tx.entity_id).await?;
    let newly_verified = !existing.field_bool("is_verified");

    let mut updates = serde_json::Map::new();
    updates.insert("is_verified".into(), json!(true));
    let mut effects = TxEffects::new().write(EntityWrite::upsert(
        EntityType::User,
        tx.entity_id.to_string(),
        merge_fields(&existing.fields, updates),
    ));
    if newly_verified {
        effects = effects.emit(ChallengeEvent::ConnectVerified, tx.entity_id, json!({}));
    }
    Ok(effects)
}

async fn tip(ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
    let sender = tx.user_id;
    let receiver = tx.entity_id;
    if sender == receiver {
        return Err(TxError::invalid(format!("user {sender} cannot tip themselves")));
    }
    ctx.require_live(EntityType::User, sender).await?;
    ctx.require_live(EntityType::User, receiver).await?;

    let metadata = ctx.resolve_metadata(tx).await?;
    let amount = metadata
        .get("amount")
        .and_then(|v| v.as_u64())
        .filter(|a| *a > 0)
        .ok_or_else(|| TxError::invalid("tip amount must be a positive integer"))?;

    Ok(TxEffects::new().emit(
        ChallengeEvent::SendTip,
        sender,
        json!({ "receiver_user_id": receiver, "amount": amount }),
    ))
}
