use crate::models::schema::users;
use diesel::{
    AsChangeset, ExpressionMethods, Identifiable, Insertable, OptionalExtension, PgConnection,
    QueryDsl, Queryable, RunQueryDsl,
};
use nostr::{PublicKey, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(
    Queryable,
    Insertable,
    Identifiable,
    AsChangeset,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    PartialEq,
    Eq,
)]
#[diesel(primary_key(npub))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct User {
    npub: Vec<u8>,
    pub name: Option<String>,
    pub nip05: Option<String>,
    pub lud16: Option<String>,
    pub balance_sats: i64,
    pub iswhitelisted: bool,
    pub isblacklisted: bool,
    pub lastactive: i64,
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = users)]
struct NewUser {
    npub: Vec<u8>,
    lastactive: i64,
}

impl User {
    pub fn npub(&self) -> PublicKey {
        PublicKey::from_slice(&self.npub).expect("Invalid key")
    }

    pub fn balance(&self) -> u64 {
        self.balance_sats.max(0) as u64
    }

    /// Display handle for logs.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.npub().to_string())
    }

    pub fn create(conn: &mut PgConnection, npub: &PublicKey) -> anyhow::Result<Self> {
        let new = NewUser {
            npub: npub.to_bytes().to_vec(),
            lastactive: Timestamp::now().as_u64() as i64,
        };

        let res = diesel::insert_into(users::table)
            .values(new)
            .get_result::<Self>(conn)?;

        Ok(res)
    }

    pub fn get(conn: &mut PgConnection, npub: &PublicKey) -> anyhow::Result<Option<Self>> {
        let res = users::table
            .filter(users::npub.eq(npub.to_bytes().to_vec()))
            .first::<Self>(conn)
            .optional()?;

        Ok(res)
    }

    pub fn get_or_create(conn: &mut PgConnection, npub: &PublicKey) -> anyhow::Result<Self> {
        match Self::get(conn, npub)? {
            Some(user) => Ok(user),
            None => Self::create(conn, npub),
        }
    }

    /// Add sats to the balance and touch `lastactive`.
    pub fn credit(&self, conn: &mut PgConnection, amount_sats: u64) -> anyhow::Result<Self> {
        let new_balance = self.balance_sats.saturating_add(amount_sats as i64);
        self.set_balance(conn, new_balance)
    }

    /// Take sats from the balance, clamped at zero, and touch `lastactive`.
    pub fn debit(&self, conn: &mut PgConnection, amount_sats: u64) -> anyhow::Result<Self> {
        let new_balance = self.balance_sats.saturating_sub(amount_sats as i64).max(0);
        self.set_balance(conn, new_balance)
    }

    fn set_balance(&self, conn: &mut PgConnection, balance_sats: i64) -> anyhow::Result<Self> {
        let res = diesel::update(users::table)
            .filter(users::npub.eq(&self.npub))
            .set((
                users::balance_sats.eq(balance_sats),
                users::lastactive.eq(Timestamp::now().as_u64() as i64),
            ))
            .get_result::<Self>(conn)?;

        Ok(res)
    }
}
