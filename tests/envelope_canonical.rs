use ln_sol_swap::envelope::sign::{Keypair, SignError, sign_envelope, verify_envelope};
use ln_sol_swap::envelope::validate::{ValidateError, validate_envelope, validate_quote_against_rfq};
use ln_sol_swap::envelope::{Body, Envelope, QuoteBody, RfqBody};

fn rfq_body() -> RfqBody {
    RfqBody {
        pair: "BTC/USDT".to_string(),
        direction: "btc_to_token".to_string(),
        app_hash: "app-1".to_string(),
        btc_sats: 1000,
        usdt_amount: "670000".to_string(),
        max_platform_fee_bps: 500,
        max_trade_fee_bps: 1000,
        max_total_fee_bps: 1500,
        min_sol_refund_window_sec: 3600,
        max_sol_refund_window_sec: 604_800,
        sol_recipient: None,
        valid_until_unix: 2_000_000_000,
    }
}

fn quote_body(rfq_id: &str) -> QuoteBody {
    QuoteBody {
        rfq_id: rfq_id.to_string(),
        pair: "BTC/USDT".to_string(),
        direction: "btc_to_token".to_string(),
        app_hash: "app-1".to_string(),
        btc_sats: 1000,
        usdt_amount: "670000".to_string(),
        platform_fee_bps: 10,
        trade_fee_bps: 10,
        trade_fee_collector: "Collector111".to_string(),
        offer_id: None,
        offer_line_index: None,
        sol_refund_window_sec: 259_200,
        valid_until_unix: 2_000_000_000,
    }
}

#[test]
fn canonical_bytes_are_a_fixed_point_of_parsing() {
    let envelope = Envelope::unsigned("trade-c1", Body::Rfq(rfq_body()));
    let bytes = envelope.unsigned_canonical_bytes().expect("canonical bytes");

    let parsed: Envelope = serde_json::from_slice(&bytes).expect("parse canonical bytes");
    assert_eq!(
        parsed.unsigned_canonical_bytes().expect("reserialize"),
        bytes
    );

    // And again, through a signed copy.
    let kp = Keypair::from_seed(&[9u8; 32]);
    let signed = sign_envelope(&envelope, &kp).expect("sign");
    let signed_json = serde_json::to_string(&signed).expect("serialize signed");
    let reparsed: Envelope = serde_json::from_str(&signed_json).expect("parse signed");
    assert_eq!(
        reparsed.unsigned_canonical_bytes().expect("reserialize signed"),
        bytes
    );
}

#[test]
fn envelope_id_is_the_hash_of_the_unsigned_form() {
    let envelope = Envelope::unsigned("trade-c2", Body::Rfq(rfq_body()));
    let unsigned_id = envelope.envelope_id().expect("unsigned id");

    let kp = Keypair::from_seed(&[10u8; 32]);
    let signed = sign_envelope(&envelope, &kp).expect("sign");
    assert_eq!(signed.envelope_id().expect("signed id"), unsigned_id);
    assert_eq!(unsigned_id.len(), 64);
}

#[test]
fn verify_succeeds_for_produced_envelopes_and_fails_on_tamper() {
    let kp = Keypair::from_seed(&[11u8; 32]);
    let signed =
        sign_envelope(&Envelope::unsigned("trade-c3", Body::Rfq(rfq_body())), &kp).expect("sign");
    verify_envelope(&signed).expect("verify own envelope");

    // Flip one digit of the amount inside the signed body.
    let mut tampered = signed.clone();
    if let Body::Rfq(body) = &mut tampered.body {
        body.usdt_amount = "670001".to_string();
    }
    assert!(matches!(
        verify_envelope(&tampered),
        Err(SignError::BadSignature)
    ));

    // Swapping the signer also invalidates the signature.
    let other = Keypair::from_seed(&[12u8; 32]);
    let mut swapped = signed;
    swapped.signer = Some(other.public_key_hex());
    assert!(matches!(
        verify_envelope(&swapped),
        Err(SignError::BadSignature)
    ));
}

#[test]
fn validator_enforces_fee_ceilings_and_window_overlap() {
    let rfq_env = Envelope::unsigned("trade-c4", Body::Rfq(rfq_body()));
    validate_envelope(&rfq_env).expect("rfq valid");
    let rfq_id = rfq_env.envelope_id().expect("rfq id");

    let quote = quote_body(&rfq_id);
    let quote_env = Envelope::unsigned("trade-c4", Body::Quote(quote.clone()));
    validate_envelope(&quote_env).expect("quote valid");
    validate_quote_against_rfq(&quote, &rfq_body()).expect("quote within ceilings");

    let mut greedy = quote.clone();
    greedy.platform_fee_bps = 501;
    assert_eq!(
        validate_quote_against_rfq(&greedy, &rfq_body()),
        Err(ValidateError::FeeCeiling("platform_fee_bps"))
    );

    let mut slow = quote;
    slow.sol_refund_window_sec = 700_000;
    let slow_env = Envelope::unsigned("trade-c4", Body::Quote(slow));
    assert!(validate_envelope(&slow_env).is_err());
}

#[test]
fn expired_rfq_still_validates_schema() {
    // Expiry is the matcher's concern, not the schema validator's.
    let mut body = rfq_body();
    body.valid_until_unix = 1;
    let env = Envelope::unsigned("trade-c5", Body::Rfq(body));
    validate_envelope(&env).expect("schema still valid");
}

#[test]
fn distinct_bodies_hash_to_distinct_ids() {
    let a = Envelope::unsigned("trade-c6", Body::Rfq(rfq_body()));
    let mut changed = rfq_body();
    changed.btc_sats = 1001;
    let mut b = Envelope::unsigned("trade-c6", Body::Rfq(changed));
    // Same ts/nonce so only the body differs.
    b.ts = a.ts;
    b.nonce = a.nonce.clone();
    assert_ne!(
        a.envelope_id().expect("id a"),
        b.envelope_id().expect("id b")
    );
}
