use testcontainers_modules::{
    postgres::Postgres,
    testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner},
};
use uuid::Uuid;

const POSTGRES_TAG: &str = "17-alpine";
const POSTGRES_PORT: u16 = 5432;

/// A throwaway Postgres for dev mode and tests.
pub struct DevContainer {
    container: ContainerAsync<Postgres>,
    db_root_password: Option<String>,
}

impl DevContainer {
    /// # Errors
    pub async fn new(container_name: &str, with_password: bool) -> anyhow::Result<Self> {
        let image = Postgres::default();
        let (image, db_root_password) = if with_password {
            let password = Uuid::now_v7().to_string();
            (image.with_password(&password), Some(password))
        } else {
            (image.with_host_auth(), None)
        };

        let container = image
            .with_tag(POSTGRES_TAG)
            .with_container_name(format!("{container_name}-{}", Uuid::now_v7()))
            .start()
            .await?;

        Ok(Self {
            container,
            db_root_password,
        })
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.db_root_password.as_deref()
    }

    /// # Errors
    pub async fn db_host(&self) -> anyhow::Result<String> {
        Ok(self.container.get_host().await?.to_string())
    }

    /// # Errors
    pub async fn db_port(&self) -> anyhow::Result<u16> {
        Ok(self.container.get_host_port_ipv4(POSTGRES_PORT).await?)
    }

    /// # Errors
    pub async fn db_url(&self) -> anyhow::Result<String> {
        let host_port = format!("{}:{}", self.db_host().await?, self.db_port().await?);

        let url = match &self.db_root_password {
            Some(password) => format!("postgres://postgres:{password}@{host_port}/postgres"),
            None => format!("postgres://postgres@{host_port}/postgres"),
        };

        Ok(url)
    }
}
