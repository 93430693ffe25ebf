// =============================================================================
// A4 — Database pool & schema
// =============================================================================
//
// The Financial Core needs a transactional relational store with
// SERIALIZABLE or row-level locking and a monotonic sequence generator; this
// crate targets Postgres via `sqlx`. Schema is applied as plain SQL at
// startup rather than through a migrations framework, matching the "do the
// simplest thing that keeps an atomic on-disk artifact" spirit of the
// config module's own tmp+rename save.
// =============================================================================

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;

    sqlx::query(SCHEMA_SQL)
        .execute(&pool)
        .await
        .context("failed to apply schema")?;

    info!("database pool connected and schema applied");
    Ok(pool)
}

pub const SCHEMA_SQL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS ledger_global_sequence;

CREATE TABLE IF NOT EXISTS wallets (
    account_id      TEXT PRIMARY KEY,
    account_type    TEXT NOT NULL,
    balance         NUMERIC(20, 4) NOT NULL DEFAULT 0,
    blocked_balance NUMERIC(20, 4) NOT NULL DEFAULT 0,
    equity          NUMERIC(20, 4) NOT NULL DEFAULT 0,
    state           TEXT NOT NULL DEFAULT 'NORMAL',
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- Double-entry postings. `debit_account_id`/`credit_account_id` are the
-- wallet-owning account; `*_account_type` names which of the five ledger
-- accounts (CASH, MARGIN_BLOCKED, UNREALIZED_PNL, REALIZED_PNL, FEES) of
-- that account the leg touches. A row with identical (id, type) on both
-- sides would be a self-transfer and is rejected at the DB level.
CREATE TABLE IF NOT EXISTS ledger_entries (
    id                   UUID PRIMARY KEY,
    global_sequence      BIGINT NOT NULL UNIQUE,
    debit_account_id     TEXT NOT NULL,
    debit_account_type   TEXT NOT NULL,
    credit_account_id    TEXT NOT NULL,
    credit_account_type  TEXT NOT NULL,
    amount               NUMERIC(20, 4) NOT NULL CHECK (amount > 0),
    currency             TEXT NOT NULL DEFAULT 'INR',
    reference_type       TEXT NOT NULL,
    reference_id         TEXT,
    idempotency_key       TEXT NOT NULL UNIQUE,
    created_at           TIMESTAMPTZ NOT NULL DEFAULT now(),
    CHECK ((debit_account_id, debit_account_type) <> (credit_account_id, credit_account_type))
);

CREATE TABLE IF NOT EXISTS journal_records (
    id              UUID PRIMARY KEY,
    operation_type  TEXT NOT NULL,
    status          TEXT NOT NULL,
    user_id         TEXT,
    reference_id    TEXT,
    payload         JSONB NOT NULL,
    checksum        TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    committed_at    TIMESTAMPTZ,
    aborted_at      TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS orders (
    id                 UUID PRIMARY KEY,
    account_id         TEXT NOT NULL REFERENCES wallets(account_id),
    instrument_segment TEXT NOT NULL,
    instrument_token   TEXT NOT NULL,
    side               TEXT NOT NULL,
    order_type         TEXT NOT NULL,
    product_type       TEXT NOT NULL,
    quantity           BIGINT NOT NULL,
    filled_quantity    BIGINT NOT NULL DEFAULT 0,
    limit_price        NUMERIC(20, 4),
    margin_blocked     NUMERIC(20, 4) NOT NULL DEFAULT 0,
    status             TEXT NOT NULL,
    rejection_reason   TEXT,
    idempotency_key    TEXT NOT NULL UNIQUE,
    created_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at         TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS trades (
    id              UUID PRIMARY KEY,
    order_id        UUID NOT NULL REFERENCES orders(id),
    account_id      TEXT NOT NULL REFERENCES wallets(account_id),
    quantity        BIGINT NOT NULL,
    price           NUMERIC(20, 4) NOT NULL,
    executed_at     TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS positions (
    id                 UUID PRIMARY KEY,
    account_id         TEXT NOT NULL REFERENCES wallets(account_id),
    instrument_segment TEXT NOT NULL,
    instrument_token   TEXT NOT NULL,
    product_type       TEXT NOT NULL,
    net_quantity       BIGINT NOT NULL,
    avg_cost           NUMERIC(20, 4) NOT NULL,
    realized_pnl       NUMERIC(20, 4) NOT NULL DEFAULT 0,
    updated_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (account_id, instrument_segment, instrument_token, product_type)
);
"#;
