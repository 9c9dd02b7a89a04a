//! Table definitions.
//!
//! `listing` belongs to the ingestion side; it is created here too so a
//! fresh database is usable end to end.

pub const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS listing (
        id               INTEGER PRIMARY KEY,
        league           TEXT    NOT NULL,
        item_name        TEXT    NOT NULL,
        stack_size       INTEGER,
        is_currency_item INTEGER NOT NULL DEFAULT 0,
        price_text       TEXT,
        currency_text    TEXT,
        note             TEXT,
        stash_note       TEXT,
        ingested_at      INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS exchange_rate (
        from_currency TEXT    NOT NULL,
        to_currency   TEXT    NOT NULL,
        league        TEXT    NOT NULL,
        rate          REAL    NOT NULL CHECK (rate > 0),
        observations  INTEGER NOT NULL DEFAULT 0,
        updated_at    INTEGER NOT NULL,
        PRIMARY KEY (from_currency, to_currency, league)
    )",
    "CREATE TABLE IF NOT EXISTS sale (
        listing_id       INTEGER PRIMARY KEY,
        league           TEXT    NOT NULL,
        item_name        TEXT    NOT NULL,
        currency         TEXT    NOT NULL,
        amount           REAL    NOT NULL,
        reference_amount REAL    NOT NULL,
        is_currency      INTEGER NOT NULL,
        recorded_at      INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS sale_league_currency ON sale (league, currency)",
    "CREATE TABLE IF NOT EXISTS deferred_listing (
        listing_id        INTEGER PRIMARY KEY,
        league            TEXT    NOT NULL,
        reason            TEXT    NOT NULL,
        attempts          INTEGER NOT NULL DEFAULT 1,
        first_deferred_at INTEGER NOT NULL,
        last_attempt_at   INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS deferred_listing_last_attempt ON deferred_listing (last_attempt_at)",
    "CREATE TABLE IF NOT EXISTS valuation_cursor (
        name    TEXT    PRIMARY KEY,
        last_id INTEGER NOT NULL
    )",
];
