use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{AuthenticationError, ErrorKind, Result};
use crate::model::{Locations, UserCredentials, UserProfile};
use crate::network::store::{self, put_document, LOCATIONS, USER_PROFILE};
use crate::process::{ProcessStep, StepContext};
use crate::processes::{Services, SessionContext};

/// Load the profile stored for `credentials`.
///
/// A missing profile and one that does not decrypt both count as failed
/// authentication.
pub async fn load_profile(
    services: &Services,
    credentials: &UserCredentials,
) -> Result<(UserProfile, u64)> {
    let location = credentials.profile_location_key();
    let loaded = store::get_document::<UserProfile>(
        services.store.as_ref(),
        &location,
        USER_PROFILE,
        &credentials.profile_key(),
    )
    .await
    .map_err(|e| match e.kind() {
        ErrorKind::Crypto | ErrorKind::Serialization => AuthenticationError::WrongCredentials {
            user_id: credentials.user_id.clone(),
        }
        .into(),
        _ => e,
    })?;

    loaded.ok_or_else(|| {
        AuthenticationError::ProfileNotFound {
            user_id: credentials.user_id.clone(),
        }
        .into()
    })
}

/// Serializes read-modify-write cycles on the user profile of this node.
///
/// Every modification re-reads the latest stored profile, so concurrent
/// processes never write back a stale snapshot.
#[derive(Clone, Default)]
pub struct ProfileManager {
    lock: Arc<Mutex<()>>,
}

impl ProfileManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `modify` to the latest profile and store it as the next version.
    ///
    /// `modify` returns whether it changed the profile; an unchanged profile
    /// is not written. Returns the profile and its store version afterwards.
    pub async fn modify<F>(
        &self,
        services: &Services,
        credentials: &UserCredentials,
        modify: F,
    ) -> Result<(UserProfile, u64, bool)>
    where
        F: FnOnce(&mut UserProfile) -> Result<bool> + Send,
    {
        let _guard = self.lock.lock().await;
        let (mut profile, version) = load_profile(services, credentials).await?;
        if !modify(&mut profile)? {
            return Ok((profile, version, false));
        }

        let next = version + 1;
        put_document(
            services.store.as_ref(),
            &credentials.profile_location_key(),
            USER_PROFILE,
            next,
            &profile,
            &credentials.profile_key(),
        )
        .await?;
        debug!(user = %credentials.user_id, version = next, "Profile updated");
        Ok((profile, next, true))
    }
}

/// Load the user's locations document, if one was published
pub async fn load_locations(
    services: &Services,
    credentials: &UserCredentials,
) -> Result<Option<(Locations, u64)>> {
    store::get_document(
        services.store.as_ref(),
        &credentials.user_id,
        LOCATIONS,
        &credentials.profile_key(),
    )
    .await
}

/// Fetches and decrypts the acting user's profile; fails fast on bad credentials
#[derive(Debug, Default)]
pub struct GetUserProfileStep;

#[async_trait]
impl<C: SessionContext> ProcessStep<C> for GetUserProfileStep {
    fn name(&self) -> &str {
        "get-user-profile"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, C>) -> Result<()> {
        let services = ctx.services().clone();
        let credentials = ctx.session().credentials.clone();

        let (profile, version) = load_profile(&services, &credentials).await?;
        info!(
            process = ctx.process_name(),
            user = %credentials.user_id,
            files = profile.files().count(),
            "Loaded user profile"
        );
        debug!(version, "Profile version");
        ctx.session_mut().set_profile(profile, version);
        Ok(())
    }
}
