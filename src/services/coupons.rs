use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::Engine;
use crate::domain::aggregates::{Coupon, CouponError, UserActiveCoupon};
use crate::domain::value_objects::CouponCode;
use crate::store::{Store, UnitOfWork};
use crate::{CommerceError, Result};

impl<S: Store> Engine<S> {
    /// Stages a coupon for the user's next checkout.
    ///
    /// The coupon must be eligible against the current cart subtotal, and the
    /// user must not already have one staged; replacing a coupon requires an
    /// explicit [`Engine::remove_coupon`] first.
    #[instrument(skip(self))]
    pub async fn apply_coupon(&self, user_id: Uuid, code: &str) -> Result<Coupon> {
        let code = CouponCode::new(code)?;
        let mut tx = self.store.begin().await?;
        let coupon = tx.coupon_by_code(&code).await?.ok_or_else(|| CommerceError::not_found("coupon", &code))?;
        if tx.active_coupon(user_id).await?.is_some() {
            warn!(%user_id, code = %code, "coupon apply rejected: another coupon is active");
            return Err(CouponError::AlreadyActive.into());
        }

        let (summary, _) = self.price_cart_in(&mut tx, user_id, Utc::now()).await?;
        coupon.check_eligibility(summary.subtotal, Utc::now())?;

        // The storage-level uniqueness check is what settles concurrent applies.
        tx.insert_active_coupon(&UserActiveCoupon::new(user_id, coupon.id)).await?;
        tx.commit().await?;
        info!(%user_id, code = %code, "coupon applied");
        Ok(coupon)
    }

    /// Unstages the user's coupon. Returns whether one was staged.
    #[instrument(skip(self))]
    pub async fn remove_coupon(&self, user_id: Uuid) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let removed = tx.delete_active_coupon(user_id).await?;
        tx.commit().await?;
        if removed { info!(%user_id, "coupon removed"); }
        Ok(removed)
    }

    /// Consumes one use of the coupon and unstages it, inside the placement unit.
    pub(super) async fn redeem_coupon_in(&self, tx: &mut S::Tx, user_id: Uuid, coupon_id: Uuid) -> Result<Coupon> {
        let coupon = tx.redeem_coupon(coupon_id).await?;
        tx.delete_active_coupon(user_id).await?;
        info!(%user_id, %coupon_id, used = coupon.used_count, limit = coupon.usage_limit, "coupon redeemed");
        Ok(coupon)
    }
}
