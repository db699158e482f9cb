//! Randomized oracle test: generates a stream of set/del instructions,
//! mirrors them into a `HashMap`, and checks after every instruction that
//! the store agrees with the oracle. Catches the split/merge edge cases
//! that hand-picked scenarios miss.

use std::collections::HashMap;

use rand::distributions::{Distribution, Uniform};
use rand::seq::IteratorRandom;
use rand::Rng;

use buildingdb::KV;

#[derive(Debug, Clone)]
enum Instruction {
    Set(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
}

fn generate_instruction(reference: &HashMap<Vec<u8>, Vec<u8>>, rng: &mut impl Rng) -> Instruction {
    let key_pool = Uniform::from(0u32..500);
    if rng.gen_bool(0.75) {
        let key = if rng.gen_bool(0.4) && !reference.is_empty() {
            reference.keys().choose(rng).unwrap().clone()
        } else {
            format!("k-{:05}", key_pool.sample(rng)).into_bytes()
        };
        let val_len = Uniform::from(0usize..200).sample(rng);
        let val: Vec<u8> = Uniform::from(0u8..=255).sample_iter(rng).take(val_len).collect();
        Instruction::Set(key, val)
    } else {
        let key = if !reference.is_empty() && rng.gen_bool(0.9) {
            reference.keys().choose(rng).unwrap().clone()
        } else {
            format!("k-{:05}", key_pool.sample(rng)).into_bytes()
        };
        Instruction::Del(key)
    }
}

fn validate(reference: &HashMap<Vec<u8>, Vec<u8>>, kv: &KV) {
    for (key, val) in reference {
        assert_eq!(
            kv.get(key).unwrap().as_ref(),
            Some(val),
            "store disagrees with oracle for key {:?}",
            key
        );
    }
}

#[test]
fn random_instruction_stream_matches_oracle() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fuzz.db");
    let mut kv = KV::open(&path).unwrap();
    let mut reference: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let mut rng = rand::thread_rng();

    for _ in 0..3000 {
        match generate_instruction(&reference, &mut rng) {
            Instruction::Set(key, val) => {
                kv.set(&key, &val).unwrap();
                reference.insert(key, val);
            }
            Instruction::Del(key) => {
                let existed = reference.remove(&key).is_some();
                assert_eq!(kv.del(&key).unwrap(), existed);
            }
        }
        validate(&reference, &kv);
    }
}

#[test]
fn reopen_after_random_stream_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fuzz_reopen.db");
    let mut reference: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let mut rng = rand::thread_rng();

    {
        let mut kv = KV::open(&path).unwrap();
        for _ in 0..500 {
            match generate_instruction(&reference, &mut rng) {
                Instruction::Set(key, val) => {
                    kv.set(&key, &val).unwrap();
                    reference.insert(key, val);
                }
                Instruction::Del(key) => {
                    let existed = reference.remove(&key).is_some();
                    assert_eq!(kv.del(&key).unwrap(), existed);
                }
            }
        }
    }

    let kv = KV::open(&path).unwrap();
    validate(&reference, &kv);
}

#[test]
fn repeated_set_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idempotent.db");
    let mut kv = KV::open(&path).unwrap();
    kv.set(b"k", b"v").unwrap();
    kv.set(b"k", b"v").unwrap();
    assert_eq!(kv.get(b"k").unwrap(), Some(b"v".to_vec()));
}
