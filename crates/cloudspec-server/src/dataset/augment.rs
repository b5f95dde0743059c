use super::snapshot::SnapshotError;
use rusqlite::Connection;

// Lookup indexes plus the floor-price rollup the price endpoints read.
// DELETE-then-INSERT keeps the rollup correct on a rerun.
const AUGMENT_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_servers_vendor ON servers(vendor_id, api_reference);
CREATE INDEX IF NOT EXISTS idx_server_prices_server ON server_prices(vendor_id, server_id);
CREATE INDEX IF NOT EXISTS idx_server_prices_region ON server_prices(vendor_id, region_id, server_id);
CREATE TABLE IF NOT EXISTS server_floor_prices (
    vendor_id TEXT NOT NULL,
    server_id TEXT NOT NULL,
    min_price REAL NOT NULL,
    currency TEXT NOT NULL,
    PRIMARY KEY (vendor_id, server_id)
);
DELETE FROM server_floor_prices;
INSERT INTO server_floor_prices (vendor_id, server_id, min_price, currency)
SELECT vendor_id, server_id, MIN(price), currency
FROM server_prices
WHERE allocation = 'ondemand'
GROUP BY vendor_id, server_id;
ANALYZE;
VACUUM;
";

/// Derived tables and indexes the query paths expect, computed on the freshly
/// written database before it is published. A failure here keeps the previous
/// generation live.
pub(crate) fn augment_dataset(conn: &Connection) -> Result<(), SnapshotError> {
    conn.execute_batch(AUGMENT_SQL)
        .map_err(|e| SnapshotError(format!("augmentation failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE servers (vendor_id TEXT, api_reference TEXT, name TEXT, vcpus INTEGER, memory_amount INTEGER);
             CREATE TABLE server_prices (vendor_id TEXT, server_id TEXT, region_id TEXT, zone_id TEXT, allocation TEXT, price REAL, currency TEXT);
             INSERT INTO server_prices VALUES ('aws', 'm5.large', 'us-east-1', 'a', 'ondemand', 0.096, 'USD');
             INSERT INTO server_prices VALUES ('aws', 'm5.large', 'eu-west-1', 'a', 'ondemand', 0.107, 'USD');
             INSERT INTO server_prices VALUES ('aws', 'm5.large', 'us-east-1', 'a', 'spot', 0.031, 'USD');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn computes_floor_prices_from_ondemand_rows() {
        let conn = fixture();
        augment_dataset(&conn).unwrap();
        let floor: f64 = conn
            .query_row(
                "SELECT min_price FROM server_floor_prices WHERE vendor_id='aws' AND server_id='m5.large'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!((floor - 0.096).abs() < 1e-9);
    }

    #[test]
    fn reruns_cleanly_on_an_already_augmented_database() {
        let conn = fixture();
        augment_dataset(&conn).unwrap();
        augment_dataset(&conn).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM server_floor_prices", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }
}
