mod common;

use rust_decimal_macros::dec;
use uuid::Uuid;

use bookstore_commerce::config::MissingBookPolicy;
use bookstore_commerce::domain::aggregates::{CouponKind, PaymentMethod};
use bookstore_commerce::domain::pricing::{AppliedOfferType, DropReason, OfferStacking};
use bookstore_commerce::domain::value_objects::Money;
use bookstore_commerce::{CommerceError, Policies};

use common::{money, pct, TestApp};

#[tokio::test]
async fn stacked_offers_price_the_cart() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let category = Uuid::new_v4();
    let book = app.seed_book_in(category, dec!(500), 10).await;
    app.seed_product_offer(book.id, dec!(10)).await;
    app.seed_category_offer(category, dec!(5)).await;
    app.store.add_to_cart(user, book.id, 2).await;

    let summary = app.engine.compute_cart(user).await.unwrap();
    assert_eq!(summary.subtotal, money(dec!(1000)));
    assert_eq!(summary.product_discount, money(dec!(100)));
    assert_eq!(summary.category_discount, money(dec!(50)));
    assert_eq!(summary.items[0].discount(), money(dec!(150)));
    assert_eq!(summary.items[0].line_total, money(dec!(850)));
    assert_eq!(summary.final_total, money(dec!(850)));
}

#[tokio::test]
async fn offer_breakdown_reports_both_axes() {
    let app = TestApp::new();
    let category = Uuid::new_v4();
    let book = app.seed_book_in(category, dec!(40), 1).await;
    app.seed_product_offer(book.id, dec!(12.5)).await;
    app.seed_category_offer(category, dec!(7.5)).await;

    let breakdown = app.engine.compute_offer_breakdown(book.id, category).await.unwrap();
    assert_eq!(breakdown.product_percent, pct(dec!(12.5)));
    assert_eq!(breakdown.category_percent, pct(dec!(7.5)));
    assert_eq!(breakdown.applied_percent, pct(dec!(20)));
    assert_eq!(breakdown.applied_type, AppliedOfferType::Stacked);

    let none = app.engine.compute_offer_breakdown(Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
    assert_eq!(none.applied_type, AppliedOfferType::None);
}

#[tokio::test]
async fn larger_offer_policy_applies_one_axis() {
    let app = TestApp::with_policies(Policies { offer_stacking: OfferStacking::Larger, ..Policies::default() });
    let user = Uuid::new_v4();
    let category = Uuid::new_v4();
    let book = app.seed_book_in(category, dec!(500), 10).await;
    app.seed_product_offer(book.id, dec!(10)).await;
    app.seed_category_offer(category, dec!(5)).await;
    app.store.add_to_cart(user, book.id, 2).await;

    let summary = app.engine.compute_cart(user).await.unwrap();
    assert_eq!(summary.product_discount, money(dec!(100)));
    assert_eq!(summary.category_discount, Money::ZERO);
    assert_eq!(summary.final_total, money(dec!(900)));
}

#[tokio::test]
async fn stacking_past_one_hundred_percent_floors_at_zero() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let category = Uuid::new_v4();
    let book = app.seed_book_in(category, dec!(30), 10).await;
    app.seed_product_offer(book.id, dec!(70)).await;
    app.seed_category_offer(category, dec!(60)).await;
    app.store.add_to_cart(user, book.id, 3).await;

    let summary = app.engine.compute_cart(user).await.unwrap();
    assert_eq!(summary.final_total, Money::ZERO);
    assert_eq!(summary.product_discount + summary.category_discount, summary.subtotal);
}

#[tokio::test]
async fn percent_coupon_is_capped_at_max_discount() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let book = app.seed_book(dec!(250), 10).await;
    app.store.add_to_cart(user, book.id, 4).await;
    let kind = CouponKind::Percent { percent: pct(dec!(20)), max_discount: Some(money(dec!(150))) };
    app.seed_coupon("SAVE20", kind, dec!(500), 10).await;

    app.engine.apply_coupon(user, "save20").await.unwrap();
    let summary = app.engine.compute_cart(user).await.unwrap();
    assert_eq!(summary.subtotal, money(dec!(1000)));
    assert_eq!(summary.coupon_discount, money(dec!(150)));
    assert_eq!(summary.coupon_code().map(|c| c.as_str()), Some("SAVE20"));
    assert_eq!(summary.final_total, money(dec!(850)));
}

#[tokio::test]
async fn flat_coupon_never_drives_total_negative() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let book = app.seed_book(dec!(80), 10).await;
    app.store.add_to_cart(user, book.id, 1).await;
    app.seed_flat_coupon("BIGFLAT", dec!(500), 5).await;

    app.engine.apply_coupon(user, "BIGFLAT").await.unwrap();
    let summary = app.engine.compute_cart(user).await.unwrap();
    assert_eq!(summary.coupon_discount, money(dec!(80)));
    assert_eq!(summary.final_total, Money::ZERO);
}

#[tokio::test]
async fn coupon_shares_split_across_lines() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    app.seed_three_line_cart(user).await;
    app.seed_flat_coupon("TENPCT", dec!(65), 5).await;
    app.engine.apply_coupon(user, "TENPCT").await.unwrap();

    let summary = app.engine.compute_cart(user).await.unwrap();
    let shares: Vec<Money> = summary.items.iter().map(|l| l.coupon_share).collect();
    assert_eq!(shares, vec![money(dec!(10)), money(dec!(40)), money(dec!(15))]);
    assert_eq!(summary.final_total, money(dec!(585)));
}

#[tokio::test]
async fn missing_books_are_reported_not_priced() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let kept = app.seed_book(dec!(20), 5).await;
    let gone = app.seed_book(dec!(35), 5).await;
    app.store.add_to_cart(user, kept.id, 1).await;
    app.store.add_to_cart(user, gone.id, 2).await;
    app.store.remove_book(gone.id).await;

    let summary = app.engine.compute_cart(user).await.unwrap();
    assert!(summary.is_partial());
    assert_eq!(summary.dropped.len(), 1);
    assert_eq!(summary.dropped[0].book_id, gone.id);
    assert_eq!(summary.dropped[0].reason, DropReason::BookNotFound);
    assert_eq!(summary.final_total, money(dec!(20)));

    // Default policy skips the missing line at placement.
    let order = app.engine.place_order(user, Uuid::new_v4(), PaymentMethod::CashOnDelivery).await.unwrap();
    assert_eq!(order.items().len(), 1);
    assert_eq!(order.final_total(), money(dec!(20)));
}

#[tokio::test]
async fn missing_books_reject_policy_fails_placement() {
    let app = TestApp::with_policies(Policies { missing_books: MissingBookPolicy::Reject, ..Policies::default() });
    let user = Uuid::new_v4();
    let kept = app.seed_book(dec!(20), 5).await;
    let gone = app.seed_book(dec!(35), 5).await;
    app.store.add_to_cart(user, kept.id, 1).await;
    app.store.add_to_cart(user, gone.id, 2).await;
    app.store.remove_book(gone.id).await;

    let err = app.engine.place_order(user, Uuid::new_v4(), PaymentMethod::CashOnDelivery).await.unwrap_err();
    assert!(matches!(err, CommerceError::InvalidInput(ref m) if m.contains(&gone.id.to_string())));
    assert_eq!(app.stock_of(kept.id).await, 5);
}

#[tokio::test]
async fn staged_coupon_that_lapsed_blocks_placement() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let book = app.seed_book(dec!(100), 5).await;
    app.store.add_to_cart(user, book.id, 1).await;
    let mut coupon = app.seed_flat_coupon("LAPSE", dec!(10), 5).await;
    app.engine.apply_coupon(user, "LAPSE").await.unwrap();

    coupon.active = false;
    app.store.put_coupon(coupon.clone()).await;

    let summary = app.engine.compute_cart(user).await.unwrap();
    assert!(summary.coupon.is_none());
    assert!(summary.coupon_rejection.is_some());
    assert_eq!(summary.final_total, money(dec!(100)));

    let err = app.engine.place_order(user, Uuid::new_v4(), PaymentMethod::CashOnDelivery).await.unwrap_err();
    assert!(matches!(err, CommerceError::InvalidInput(_)));
    assert_eq!(app.stock_of(book.id).await, 5);
    assert_eq!(app.used_count(coupon.id).await, 0);
}

#[tokio::test]
async fn empty_cart_cannot_be_placed() {
    let app = TestApp::new();
    let err = app.engine.place_order(Uuid::new_v4(), Uuid::new_v4(), PaymentMethod::Online).await.unwrap_err();
    assert!(matches!(err, CommerceError::InvalidInput(_)));
}
