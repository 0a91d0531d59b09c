use anyhow::{bail, Context, Result};
use fs_err as fs;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::time::sleep;
use tracing::{debug, error};

use crate::authority::{CertificateAuthority, IssueError};

/// ACME client answering HTTP-01 challenges from a webroot directory.
pub struct AcmeClient {
    account: Account,
    credentials: Credentials,
    challenge_dir: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Clone)]
struct Challenge {
    token_path: PathBuf,
    url: String,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct Credentials {
    pub(crate) account_id: String,
    credentials: AccountCredentials,
}

impl AcmeClient {
    pub async fn load(
        encoded_credentials: &str,
        challenge_dir: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<Self> {
        let credentials: Credentials =
            serde_json::from_str(encoded_credentials).context("invalid account credentials")?;
        let account = Account::from_credentials(credentials.credentials).await?;
        let credentials: Credentials = serde_json::from_str(encoded_credentials)?;
        Ok(Self {
            account,
            credentials,
            challenge_dir: challenge_dir.as_ref().to_path_buf(),
            timeout,
        })
    }

    /// Register a new account with the authority.
    pub async fn new_account(
        acme_url: &str,
        challenge_dir: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<Self> {
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            acme_url,
            None,
        )
        .await
        .context("failed to create new account")?;
        let credentials = Credentials {
            account_id: account.id().to_string(),
            credentials,
        };
        Ok(Self {
            account,
            credentials,
            challenge_dir: challenge_dir.as_ref().to_path_buf(),
            timeout,
        })
    }

    /// Dump the account credentials to a JSON string.
    pub fn dump_credentials(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.credentials)?)
    }

    pub fn account_id(&self) -> &str {
        &self.credentials.account_id
    }
}

impl CertificateAuthority for AcmeClient {
    async fn sign(&self, domain: &str, csr_der: &[u8]) -> Result<String, IssueError> {
        let mut challenges = Vec::new();
        let result = tokio::time::timeout(
            self.timeout,
            self.sign_inner(domain, csr_der, &mut challenges),
        )
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("timed out requesting certificate for {domain}")));
        for challenge in &challenges {
            debug!("removing challenge file {}", challenge.token_path.display());
            if let Err(err) = fs::remove_file(&challenge.token_path) {
                error!("failed to remove challenge file: {err}");
            }
        }
        // The full chain carries the authority's problem detail.
        result.map_err(|err| IssueError::from_authority_message(&format!("{err:#}")))
    }
}

impl AcmeClient {
    async fn authorize(&self, order: &mut Order, challenges: &mut Vec<Challenge>) -> Result<()> {
        let authorizations = order
            .authorizations()
            .await
            .context("failed to get authorizations")?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                _ => bail!("unsupported authorization status: {:?}", authz.status),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .context("no http01 challenge found")?;

            let Identifier::Dns(identifier) = &authz.identifier;
            debug!("writing http01 challenge for {identifier}");

            let key_authorization = order.key_authorization(challenge);
            fs::create_dir_all(&self.challenge_dir)
                .context("failed to create challenge directory")?;
            let token_path = self.challenge_dir.join(&challenge.token);
            fs::write(&token_path, key_authorization.as_str())
                .context("failed to write challenge file")?;
            challenges.push(Challenge {
                token_path,
                url: challenge.url.clone(),
            });
        }
        Ok(())
    }

    async fn sign_inner(
        &self,
        domain: &str,
        csr_der: &[u8],
        challenges: &mut Vec<Challenge>,
    ) -> Result<String> {
        debug!("creating new order for {domain}");
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .context("failed to create new order")?;
        let mut challenges_ready = false;
        loop {
            order.refresh().await.context("failed to refresh order")?;
            match order.state().status {
                // Need to accept the challenge
                OrderStatus::Pending => {
                    if challenges_ready {
                        debug!("challenges are ready, waiting for order to be ready");
                        sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                    debug!("order is pending, waiting for authorization");
                    self.authorize(&mut order, challenges)
                        .await
                        .context("failed to authorize")?;
                    for challenge in &*challenges {
                        debug!("setting challenge ready for {}", challenge.url);
                        order
                            .set_challenge_ready(&challenge.url)
                            .await
                            .context("failed to set challenge ready")?;
                    }
                    challenges_ready = true;
                    continue;
                }
                // To upload CSR
                OrderStatus::Ready => {
                    debug!("order is ready, uploading CSR");
                    order
                        .finalize(csr_der)
                        .await
                        .context("failed to finalize order")?;
                    continue;
                }
                OrderStatus::Processing => {
                    debug!("order is processing, waiting for the CSR to be accepted");
                    sleep(Duration::from_secs(2)).await;
                    continue;
                }
                OrderStatus::Valid => {
                    debug!("order is valid, getting certificate");
                    return extract_certificate(order).await;
                }
                OrderStatus::Invalid => match &order.state().error {
                    Some(problem) => bail!("order is invalid: {problem}"),
                    None => bail!("order is invalid"),
                },
            }
        }
    }
}

async fn extract_certificate(mut order: Order) -> Result<String> {
    let mut tries = 0;
    let cert_chain_pem = loop {
        tries += 1;
        if tries > 5 {
            bail!("failed to get certificate");
        }
        match order
            .certificate()
            .await
            .context("failed to get certificate")?
        {
            Some(cert_chain_pem) => break cert_chain_pem,
            None => sleep(Duration::from_secs(1)).await,
        }
    };
    Ok(cert_chain_pem)
}
