//! Benchmark utilities.

use dsrepl_core::{AttributeChange, Csn, Operation, UpdateRecord};
use rand::seq::SliceRandom;
use rand::Rng;

/// Random printable attribute value of `size` bytes.
pub fn random_value(size: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| char::from(rng.gen_range(b'a'..=b'z'))).collect()
}

/// `count` modify records spread over `replicas`, in CSN order.
pub fn generate_updates(count: usize, replicas: u16, value_size: usize) -> Vec<UpdateRecord> {
    (0..count)
        .map(|i| {
            let replica_id = (i % usize::from(replicas)) as u16 + 1;
            let csn = Csn::new(1_000 + i as u64, 0, replica_id);
            let value = random_value(value_size);
            UpdateRecord::new(
                csn,
                format!("cn=user{},dc=example,dc=com", i % 100),
                Operation::Modify {
                    changes: vec![AttributeChange::replace("description", [value.as_str()])],
                },
            )
        })
        .collect()
}

/// The same updates in a random arrival order.
pub fn shuffled(mut updates: Vec<UpdateRecord>) -> Vec<UpdateRecord> {
    updates.shuffle(&mut rand::thread_rng());
    updates
}
