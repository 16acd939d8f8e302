use std::fmt;

use async_trait::async_trait;
use tracing::info;

use crate::error::{AuthenticationError, Result};
use crate::model::{Locations, UserCredentials, UserProfile};
use crate::network::store::{put_document, LOCATIONS, USER_PROFILE};
use crate::process::{Process, ProcessStep, StepContext};
use crate::processes::{Services, Session, SessionContext};

/// Working state of a registration
pub struct RegisterContext {
    pub services: Services,
    pub session: Session,
}

impl fmt::Debug for RegisterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterContext")
            .field("user", &self.session.credentials.user_id)
            .finish_non_exhaustive()
    }
}

impl SessionContext for RegisterContext {
    fn services(&self) -> &Services {
        &self.services
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

/// Build the registration process for `credentials`
pub fn build(services: Services, credentials: UserCredentials) -> Process<RegisterContext> {
    let name = format!("register:{}", credentials.user_id);
    Process::new(
        name,
        RegisterContext {
            services,
            session: Session::new(credentials),
        },
    )
    .with_step(CheckUserAbsentStep)
    .with_step(PutUserProfileStep)
    .with_step(PutLocationsStep)
}

struct CheckUserAbsentStep;

#[async_trait]
impl ProcessStep<RegisterContext> for CheckUserAbsentStep {
    fn name(&self) -> &str {
        "check-user-absent"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, RegisterContext>) -> Result<()> {
        let store = ctx.services.store.clone();
        let credentials = ctx.session.credentials.clone();

        let profile = store
            .get(&credentials.profile_location_key(), USER_PROFILE)
            .await?;
        let locations = store.get(&credentials.user_id, LOCATIONS).await?;

        if profile.is_some() || locations.is_some() {
            return Err(AuthenticationError::UserExists {
                user_id: credentials.user_id,
            }
            .into());
        }
        Ok(())
    }
}

struct PutUserProfileStep;

#[async_trait]
impl ProcessStep<RegisterContext> for PutUserProfileStep {
    fn name(&self) -> &str {
        "put-user-profile"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, RegisterContext>) -> Result<()> {
        let store = ctx.services.store.clone();
        let credentials = ctx.session.credentials.clone();
        let profile = UserProfile::new(credentials.user_id.clone())?;

        put_document(
            store.as_ref(),
            &credentials.profile_location_key(),
            USER_PROFILE,
            0,
            &profile,
            &credentials.profile_key(),
        )
        .await?;

        info!(user = %credentials.user_id, "User profile created");
        ctx.session.set_profile(profile, 0);
        Ok(())
    }

    async fn rollback(&mut self, context: &mut RegisterContext) -> Result<()> {
        let location = context.session.credentials.profile_location_key();
        context.services.store.remove(&location, USER_PROFILE, 0).await
    }
}

struct PutLocationsStep;

#[async_trait]
impl ProcessStep<RegisterContext> for PutLocationsStep {
    fn name(&self) -> &str {
        "put-locations"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, RegisterContext>) -> Result<()> {
        let store = ctx.services.store.clone();
        let credentials = ctx.session.credentials.clone();
        put_document(
            store.as_ref(),
            &credentials.user_id,
            LOCATIONS,
            0,
            &Locations::new(credentials.user_id.clone()),
            &credentials.profile_key(),
        )
        .await
    }

    async fn rollback(&mut self, context: &mut RegisterContext) -> Result<()> {
        let user_id = context.session.credentials.user_id.clone();
        context.services.store.remove(&user_id, LOCATIONS, 0).await
    }
}
