//! Synchronous execution of crypto requests inside a worker.

use ecash_core::Amount;
use ecash_core::exchange::RecoupRequest;
use ecash_core::types::{DenomCipher, DenominationPubKey, EddsaPrivateKey, EddsaPublicKey, Hash256};

use crate::error::CryptoError;
use crate::ops::{
    CreatePlanchetRequest, CreateRecoupRequest, CryptoRequest, CryptoResponse,
    DepositPermissionRequest, DeriveRefreshSessionRequest, DerivedRefreshSession,
    PlanchetCreationResult, RefreshPlanchet, SignCoinLinkRequest, UnblindRequest,
    VerifyDenominationSignatureRequest,
};
use crate::primitives::{self, Purpose};

const KDF_PLANCHET_COIN: &str = "ecash-wallet planchet coin v1";
const KDF_PLANCHET_BLINDING: &str = "ecash-wallet planchet blinding v1";
const KDF_REFRESH_TRANSFER: &str = "ecash-wallet refresh transfer v1";
const KDF_REFRESH_LINK: &str = "ecash-wallet refresh link v1";
const KDF_REFRESH_COIN: &str = "ecash-wallet refresh coin v1";
const KDF_REFRESH_BLINDING: &str = "ecash-wallet refresh blinding v1";

/// Executes one request. Runs on a worker thread, never on the scheduler.
pub trait CryptoImplementation: Send + Sync + 'static {
    fn execute(&self, request: CryptoRequest) -> Result<CryptoResponse, CryptoError>;
}

/// Default primitive set: Ed25519 signatures, SHA-256 envelopes, BLAKE3 KDF.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Implementation;

fn eddsa_denom_key(denom_pub: &DenominationPubKey, operation: &'static str) -> Result<EddsaPublicKey, CryptoError> {
    if denom_pub.cipher != DenomCipher::Eddsa {
        return Err(CryptoError::OperationFailed {
            operation,
            message: format!("unsupported denomination cipher {:?}", denom_pub.cipher),
        });
    }
    let bytes: [u8; 32] = denom_pub.key.as_slice().try_into().map_err(|_| CryptoError::InvalidKey)?;
    Ok(EddsaPublicKey(bytes))
}

fn amount_bytes(amount: &Amount) -> Vec<u8> {
    amount.to_string().into_bytes()
}

fn amount_err(operation: &'static str) -> impl Fn(ecash_core::AmountError) -> CryptoError {
    move |e| CryptoError::OperationFailed { operation, message: e.to_string() }
}

impl Ed25519Implementation {
    fn create_planchet(&self, req: CreatePlanchetRequest) -> Result<PlanchetCreationResult, CryptoError> {
        let index = req.coin_index.to_le_bytes();
        let coin = primitives::keypair_from_secret(primitives::derive_secret(
            KDF_PLANCHET_COIN,
            &[&req.secret_seed, &index],
        ));
        let blinding_key = primitives::derive_secret(KDF_PLANCHET_BLINDING, &[&req.secret_seed, &index]);
        let coin_ev = primitives::coin_envelope(&coin.pub_key);
        let coin_ev_hash = primitives::sha256(&coin_ev);
        let denom_pub_hash = req.denom_pub.hash();
        let amount_with_fee = req
            .value
            .saturating_add(&req.fee_withdraw)
            .map_err(amount_err("create_planchet"))?;
        let msg = primitives::signed_message(
            Purpose::Withdraw,
            &[
                req.reserve_pub.as_ref(),
                denom_pub_hash.as_ref(),
                coin_ev_hash.as_ref(),
                &amount_bytes(&amount_with_fee),
            ],
        );
        Ok(PlanchetCreationResult {
            coin_pub: coin.pub_key,
            coin_priv: coin.priv_key.clone(),
            reserve_pub: req.reserve_pub,
            denom_pub_hash,
            blinding_key,
            withdraw_sig: primitives::sign(&req.reserve_priv, &msg),
            coin_ev,
            coin_ev_hash,
            coin_value: req.value,
        })
    }

    fn unblind(&self, req: UnblindRequest) -> Result<Vec<u8>, CryptoError> {
        eddsa_denom_key(&req.denom_pub, "unblind_signature")?;
        Ok(req.blinded_sig)
    }

    fn verify_denom_sig(&self, req: VerifyDenominationSignatureRequest) -> Result<bool, CryptoError> {
        let key = eddsa_denom_key(&req.denom_pub, "verify_denomination_signature")?;
        let envelope = primitives::coin_envelope(&req.coin_pub);
        Ok(primitives::verify(&key, &envelope, &req.denom_sig))
    }

    fn sign_deposit_permission(&self, req: DepositPermissionRequest) -> Vec<u8> {
        let msg = primitives::signed_message(
            Purpose::Deposit,
            &[
                req.contract_terms_hash.as_ref(),
                req.h_wire.as_ref(),
                req.merchant_pub.as_ref(),
                req.coin_pub.as_ref(),
                req.denom_pub_hash.as_ref(),
                &amount_bytes(&req.contribution),
                &amount_bytes(&req.fee_deposit),
                &req.timestamp.as_millis().to_be_bytes(),
                &req.refund_deadline.as_millis().to_be_bytes(),
                &req.wire_transfer_deadline.as_millis().to_be_bytes(),
            ],
        );
        primitives::sign(&req.coin_priv, &msg)
    }

    fn derive_refresh_session(&self, req: DeriveRefreshSessionRequest) -> Result<DerivedRefreshSession, CryptoError> {
        let err = amount_err("derive_refresh_session");
        let mut melt_value = Amount::zero(req.fee_refresh.currency.clone());
        for d in &req.new_denoms {
            let per_coin = d.value.saturating_add(&d.fee_withdraw).map_err(&err)?;
            melt_value = melt_value.saturating_add(&per_coin.mult(u64::from(d.count)).amount).map_err(&err)?;
        }
        let melt_value_with_fee = melt_value.saturating_add(&req.fee_refresh).map_err(&err)?;

        let mut transfer_pubs = Vec::with_capacity(req.kappa);
        let mut transfer_privs = Vec::with_capacity(req.kappa);
        let mut planchets_for_gammas = Vec::with_capacity(req.kappa);
        let mut commitment = blake3::Hasher::new();
        commitment.update(req.melt_coin_pub.as_ref());
        commitment.update(&amount_bytes(&melt_value_with_fee));

        for gamma in 0..req.kappa {
            let transfer = primitives::keypair_from_secret(primitives::derive_secret(
                KDF_REFRESH_TRANSFER,
                &[&req.session_secret_seed, &(gamma as u32).to_le_bytes()],
            ));
            let link_secret = primitives::derive_secret(
                KDF_REFRESH_LINK,
                &[transfer.priv_key.as_bytes(), req.melt_coin_pub.as_ref()],
            );
            commitment.update(transfer.pub_key.as_ref());

            let mut planchets = Vec::new();
            let denoms = req.new_denoms.iter().flat_map(|d| std::iter::repeat_n(d, d.count as usize));
            for (j, _denom) in denoms.enumerate() {
                let j = (j as u32).to_le_bytes();
                let coin = primitives::keypair_from_secret(primitives::derive_secret(
                    KDF_REFRESH_COIN,
                    &[&link_secret, &j],
                ));
                let blinding_key = primitives::derive_secret(KDF_REFRESH_BLINDING, &[&link_secret, &j]);
                let coin_ev = primitives::coin_envelope(&coin.pub_key);
                let coin_ev_hash = primitives::sha256(&coin_ev);
                commitment.update(&coin_ev);
                planchets.push(RefreshPlanchet {
                    coin_pub: coin.pub_key,
                    coin_priv: coin.priv_key.clone(),
                    blinding_key,
                    coin_ev,
                    coin_ev_hash,
                });
            }
            transfer_pubs.push(transfer.pub_key);
            transfer_privs.push(transfer.priv_key.clone());
            planchets_for_gammas.push(planchets);
        }

        let rc = Hash256(*commitment.finalize().as_bytes());
        let msg = primitives::signed_message(
            Purpose::Melt,
            &[
                rc.as_ref(),
                &amount_bytes(&melt_value_with_fee),
                &amount_bytes(&req.fee_refresh),
                req.melt_coin_pub.as_ref(),
                req.melt_coin_denom_pub_hash.as_ref(),
            ],
        );
        Ok(DerivedRefreshSession {
            transfer_pubs,
            transfer_privs,
            planchets_for_gammas,
            rc,
            confirm_sig: primitives::sign(&req.melt_coin_priv, &msg),
            melt_value_with_fee,
        })
    }

    fn sign_coin_link(&self, req: SignCoinLinkRequest) -> Vec<u8> {
        let coin_ev_hash = primitives::sha256(&req.coin_ev);
        let msg = primitives::signed_message(
            Purpose::CoinLink,
            &[
                req.new_denom_hash.as_ref(),
                req.transfer_pub.as_ref(),
                coin_ev_hash.as_ref(),
                req.old_coin_pub.as_ref(),
            ],
        );
        primitives::sign(&req.old_coin_priv, &msg)
    }

    fn create_recoup_request(&self, req: CreateRecoupRequest) -> RecoupRequest {
        let msg = primitives::signed_message(
            Purpose::Recoup,
            &[req.coin_pub.as_ref(), req.denom_pub_hash.as_ref(), &req.blinding_key],
        );
        RecoupRequest {
            coin_pub: req.coin_pub,
            denom_pub_hash: req.denom_pub_hash,
            denom_sig: req.denom_sig,
            coin_blind_key_secret: req.blinding_key,
            coin_sig: primitives::sign(&req.coin_priv, &msg),
            refreshed: req.refreshed,
        }
    }
}

impl CryptoImplementation for Ed25519Implementation {
    fn execute(&self, request: CryptoRequest) -> Result<CryptoResponse, CryptoError> {
        Ok(match request {
            CryptoRequest::CreatePlanchet(req) => CryptoResponse::Planchet(self.create_planchet(req)?),
            CryptoRequest::HashString(s) => CryptoResponse::Hash(primitives::sha256(s.as_bytes())),
            CryptoRequest::CreateEddsaKeypair => CryptoResponse::KeyPair(primitives::random_keypair()),
            CryptoRequest::CreateRecoupRequest(req) => {
                CryptoResponse::RecoupRequest(self.create_recoup_request(req))
            }
            CryptoRequest::SignDepositPermission(req) => {
                CryptoResponse::Signature(self.sign_deposit_permission(req))
            }
            CryptoRequest::UnblindSignature(req) => CryptoResponse::Signature(self.unblind(req)?),
            CryptoRequest::VerifyDenominationSignature(req) => {
                CryptoResponse::Verified(self.verify_denom_sig(req)?)
            }
            CryptoRequest::DeriveRefreshSession(req) => {
                CryptoResponse::RefreshSession(self.derive_refresh_session(req)?)
            }
            CryptoRequest::SignCoinLink(req) => CryptoResponse::Signature(self.sign_coin_link(req)),
        })
    }
}

/// Key material an exchange would use for one Ed25519 denomination.
pub fn eddsa_denomination_key(secret: [u8; 32]) -> (DenominationPubKey, EddsaPrivateKey) {
    let kp = primitives::keypair_from_secret(secret);
    (DenominationPubKey::eddsa(kp.pub_key), kp.priv_key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::RefreshDenomination;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn planchet_req(index: u32) -> CreatePlanchetRequest {
        let reserve = primitives::keypair_from_secret([3; 32]);
        let (denom_pub, _) = eddsa_denomination_key([9; 32]);
        CreatePlanchetRequest {
            secret_seed: [5; 32],
            coin_index: index,
            denom_pub,
            value: amt("EUR:1"),
            fee_withdraw: amt("EUR:0.01"),
            reserve_pub: reserve.pub_key,
            reserve_priv: reserve.priv_key.clone(),
        }
    }

    #[test]
    fn planchets_are_deterministic_per_index() {
        let imp = Ed25519Implementation;
        let a = imp.create_planchet(planchet_req(0)).unwrap();
        let b = imp.create_planchet(planchet_req(0)).unwrap();
        let c = imp.create_planchet(planchet_req(1)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.coin_pub, c.coin_pub);
        assert_eq!(a.coin_ev_hash, primitives::sha256(&a.coin_ev));
    }

    #[test]
    fn exchange_signature_verifies_after_unblind() {
        let imp = Ed25519Implementation;
        let (denom_pub, denom_priv) = eddsa_denomination_key([9; 32]);
        let p = imp.create_planchet(planchet_req(0)).unwrap();
        let ev_sig = primitives::sign(&denom_priv, &p.coin_ev);
        let sig = imp
            .unblind(UnblindRequest { blinded_sig: ev_sig, blinding_key: p.blinding_key, denom_pub: denom_pub.clone() })
            .unwrap();
        let ok = imp
            .verify_denom_sig(VerifyDenominationSignatureRequest { coin_pub: p.coin_pub, denom_sig: sig.clone(), denom_pub: denom_pub.clone() })
            .unwrap();
        assert!(ok);
        let other = imp.create_planchet(planchet_req(1)).unwrap();
        let bad = imp
            .verify_denom_sig(VerifyDenominationSignatureRequest { coin_pub: other.coin_pub, denom_sig: sig, denom_pub })
            .unwrap();
        assert!(!bad);
    }

    #[test]
    fn rsa_denominations_are_reported_not_panicked() {
        let imp = Ed25519Implementation;
        let denom_pub = DenominationPubKey { cipher: DenomCipher::Rsa, key: vec![1, 2, 3] };
        let r = imp.execute(CryptoRequest::UnblindSignature(UnblindRequest {
            blinded_sig: vec![],
            blinding_key: [0; 32],
            denom_pub,
        }));
        assert!(matches!(r, Err(CryptoError::OperationFailed { .. })));
    }

    #[test]
    fn refresh_session_shape_and_melt_value() {
        let imp = Ed25519Implementation;
        let melt = primitives::keypair_from_secret([4; 32]);
        let (denom_pub, _) = eddsa_denomination_key([9; 32]);
        let session = imp
            .derive_refresh_session(DeriveRefreshSessionRequest {
                session_secret_seed: [6; 32],
                kappa: 3,
                melt_coin_pub: melt.pub_key,
                melt_coin_priv: melt.priv_key.clone(),
                melt_coin_denom_pub_hash: Hash256([1; 32]),
                new_denoms: vec![RefreshDenomination {
                    denom_pub,
                    value: amt("EUR:0.5"),
                    fee_withdraw: amt("EUR:0.01"),
                    count: 2,
                }],
                fee_refresh: amt("EUR:0.02"),
            })
            .unwrap();
        assert_eq!(session.transfer_pubs.len(), 3);
        assert!(session.planchets_for_gammas.iter().all(|g| g.len() == 2));
        assert_eq!(session.melt_value_with_fee, amt("EUR:1.04"));
        assert_ne!(
            session.planchets_for_gammas[0][0].coin_pub,
            session.planchets_for_gammas[1][0].coin_pub
        );
    }

    #[test]
    fn hash_string_is_sha256() {
        let r = Ed25519Implementation.execute(CryptoRequest::HashString("abc".into())).unwrap();
        let CryptoResponse::Hash(h) = r else { panic!("wrong variant") };
        assert_eq!(
            h.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
