use std::fmt;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{Locations, UserCredentials};
use crate::network::store::{put_document, LOCATIONS};
use crate::process::{Process, ProcessStep, StepContext};
use crate::processes::common::{load_locations, GetUserProfileStep};
use crate::processes::{Services, Session, SessionContext};

/// Working state of a login
pub struct LoginContext {
    pub services: Services,
    pub session: Session,
    /// Locations version published by this login, if any
    pub published_locations: Option<u64>,
}

impl fmt::Debug for LoginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginContext")
            .field("user", &self.session.credentials.user_id)
            .field("published_locations", &self.published_locations)
            .finish_non_exhaustive()
    }
}

impl SessionContext for LoginContext {
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

/// Build the login process: load profile, announce this peer, start serving
pub fn build(services: Services, credentials: UserCredentials) -> Process<LoginContext> {
    let name = format!("login:{}", credentials.user_id);
    Process::new(
        name,
        LoginContext {
            services,
            session: Session::new(credentials),
            published_locations: None,
        },
    )
    .with_step(GetUserProfileStep)
    .with_step(AddSelfToLocationsStep)
    .with_step(ActivateServerStep)
}

struct AddSelfToLocationsStep;

#[async_trait]
impl ProcessStep<LoginContext> for AddSelfToLocationsStep {
    fn name(&self) -> &str {
        "add-self-to-locations"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, LoginContext>) -> Result<()> {
        let services = ctx.services.clone();
        let credentials = ctx.session.credentials.clone();
        let local = services.channel.local_peer();

        let (mut locations, version) = match load_locations(&services, &credentials).await? {
            Some((locations, version)) => (locations, version + 1),
            None => (Locations::new(credentials.user_id.clone()), 0),
        };
        if !locations.add_peer(local) {
            debug!(peer = %local, "Peer already listed in locations");
            return Ok(());
        }

        put_document(
            services.store.as_ref(),
            &credentials.user_id,
            LOCATIONS,
            version,
            &locations,
            &credentials.profile_key(),
        )
        .await?;

        info!(peer = %local, peers = locations.peers().len(), "Added peer to user locations");
        ctx.published_locations = Some(version);
        Ok(())
    }

    async fn rollback(&mut self, context: &mut LoginContext) -> Result<()> {
        if let Some(version) = context.published_locations.take() {
            let user_id = context.session.credentials.user_id.clone();
            context.services.store.remove(&user_id, LOCATIONS, version).await?;
        }
        Ok(())
    }
}

struct ActivateServerStep;

#[async_trait]
impl ProcessStep<LoginContext> for ActivateServerStep {
    fn name(&self) -> &str {
        "activate-server"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, LoginContext>) -> Result<()> {
        let key = ctx.session.profile()?.public_key()?;
        let server = ctx.services.server.clone();
        server.activate(key).await;
        Ok(())
    }

    async fn rollback(&mut self, context: &mut LoginContext) -> Result<()> {
        context.services.server.deactivate().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::process::ProcessState;
    use crate::processes::register;
    use crate::processes::testing::memory_services;

    #[tokio::test]
    async fn test_login_publishes_peer_once() {
        let (services, _dir) = memory_services().await;
        let credentials = UserCredentials::new("bob", "pw", "0000");
        register::build(services.clone(), credentials.clone())
            .execute()
            .await
            .unwrap();

        let first = build(services.clone(), credentials.clone())
            .execute()
            .await
            .unwrap();
        assert_eq!(first.published_locations, Some(1));
        assert!(services.server.is_active().await);

        let second = build(services.clone(), credentials.clone())
            .execute()
            .await
            .unwrap();
        assert_eq!(second.published_locations, None);

        let (locations, _) = load_locations(&services, &credentials).await.unwrap().unwrap();
        assert_eq!(locations.peers(), &[services.channel.local_peer()]);
    }

    #[tokio::test]
    async fn test_wrong_credentials_fail_fast() {
        let (services, _dir) = memory_services().await;
        register::build(services.clone(), UserCredentials::new("bob", "pw", "0000"))
            .execute()
            .await
            .unwrap();

        let mut process = build(services.clone(), UserCredentials::new("bob", "pw", "1111"));
        let err = process.start().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(process.state(), ProcessState::Failed);
        assert_eq!(process.cursor(), 0);
        assert!(!services.server.is_active().await);
    }
}
