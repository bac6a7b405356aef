// Decoder for the MintStreet bonding-curve program. Instruction payloads are
// Anchor-shaped: an 8-byte discriminator (sha256("global:<name>")[..8])
// followed by Borsh-encoded arguments. Anything we cannot read decodes to
// `MarketInstruction::Unknown` and the record is kept, never dropped.

use crate::models::{
    EnhancedInstruction, EnhancedTransaction, HistoryItem, MarketInstruction, RecordSource,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use borsh::{BorshDeserialize, BorshSerialize};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

pub struct InstructionSchema {
    pub name: &'static str,
    pub discriminator: [u8; 8],
    /// Named account slots in the order the program expects them.
    pub account_slots: &'static [&'static str],
}

fn anchor_discriminator(ix_name: &str) -> [u8; 8] {
    let preimage = format!("global:{ix_name}");
    let hash = Sha256::digest(preimage.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}

/// The program's instruction table, discriminators computed once at first use.
pub fn program_schemas() -> &'static [InstructionSchema; 4] {
    static SCHEMAS: OnceLock<[InstructionSchema; 4]> = OnceLock::new();
    SCHEMAS.get_or_init(|| {
        [
            InstructionSchema {
                name: "createPool",
                discriminator: anchor_discriminator("createPool"),
                account_slots: &["payer", "pool", "escrow", "system_program"],
            },
            InstructionSchema {
                name: "createCollectionNft",
                discriminator: anchor_discriminator("createCollectionNft"),
                account_slots: &["payer", "pool", "collection_mint", "metadata", "system_program"],
            },
            InstructionSchema {
                name: "mintNft",
                discriminator: anchor_discriminator("mintNft"),
                account_slots: &["payer", "pool", "escrow", "nft_mint", "metadata", "system_program"],
            },
            InstructionSchema {
                name: "sellNft",
                discriminator: anchor_discriminator("sellNft"),
                account_slots: &["seller", "pool", "escrow", "nft_mint", "token_account"],
            },
        ]
    })
}

// args: basePrice(u64), growthFactorBps(u64)
#[derive(BorshSerialize, BorshDeserialize)]
struct CreatePoolArgs {
    base_price_lamports: u64,
    growth_factor_bps: u64,
}

// args: name(String), symbol(String), uri(String), shared by
// createCollectionNft and mintNft.
#[derive(BorshSerialize, BorshDeserialize)]
struct MetadataArgs {
    name: String,
    symbol: String,
    uri: String,
}

/// Decode an instruction payload string: base58 first (the indexer API's
/// encoding), base64 as a fallback for webhook senders that use it.
pub fn decode_payload(data: &str) -> Option<Vec<u8>> {
    bs58::decode(data)
        .into_vec()
        .ok()
        .or_else(|| BASE64.decode(data).ok())
}

/// Match the discriminator and Borsh-decode the arguments. Every failure
/// path returns `Unknown`.
pub fn decode_instruction(data: &[u8]) -> MarketInstruction {
    if data.len() < 8 {
        return MarketInstruction::Unknown;
    }
    let disc: [u8; 8] = match data[..8].try_into() {
        Ok(d) => d,
        Err(_) => return MarketInstruction::Unknown,
    };
    let args = &data[8..];
    let schemas = program_schemas();

    if disc == schemas[0].discriminator {
        match CreatePoolArgs::try_from_slice(args) {
            Ok(a) => MarketInstruction::CreatePool {
                base_price_lamports: a.base_price_lamports,
                growth_factor_bps: a.growth_factor_bps,
            },
            Err(e) => {
                tracing::debug!("createPool args failed to decode: {e}");
                MarketInstruction::Unknown
            }
        }
    } else if disc == schemas[1].discriminator {
        match MetadataArgs::try_from_slice(args) {
            Ok(a) => MarketInstruction::CreateCollectionNft {
                name: a.name,
                symbol: a.symbol,
                uri: a.uri,
            },
            Err(e) => {
                tracing::debug!("createCollectionNft args failed to decode: {e}");
                MarketInstruction::Unknown
            }
        }
    } else if disc == schemas[2].discriminator {
        match MetadataArgs::try_from_slice(args) {
            Ok(a) => MarketInstruction::MintNft {
                name: a.name,
                symbol: a.symbol,
                uri: a.uri,
            },
            Err(e) => {
                tracing::debug!("mintNft args failed to decode: {e}");
                MarketInstruction::Unknown
            }
        }
    } else if disc == schemas[3].discriminator {
        // sellNft carries no arguments; trailing bytes mean a layout we
        // do not understand.
        if args.is_empty() {
            MarketInstruction::SellNft
        } else {
            tracing::debug!("sellNft carried {} unexpected arg bytes", args.len());
            MarketInstruction::Unknown
        }
    } else {
        MarketInstruction::Unknown
    }
}

pub fn schema_for(instruction: &MarketInstruction) -> Option<&'static InstructionSchema> {
    let schemas = program_schemas();
    match instruction {
        MarketInstruction::CreatePool { .. } => Some(&schemas[0]),
        MarketInstruction::CreateCollectionNft { .. } => Some(&schemas[1]),
        MarketInstruction::MintNft { .. } => Some(&schemas[2]),
        MarketInstruction::SellNft => Some(&schemas[3]),
        MarketInstruction::Unknown => None,
    }
}

/// Look up a named account slot in the instruction's account list. `None`
/// when the schema has no such slot or the list is short.
pub fn resolve_slot(
    schema: &InstructionSchema,
    accounts: &[String],
    slot: &str,
) -> Option<String> {
    let idx = schema.account_slots.iter().position(|s| *s == slot)?;
    accounts.get(idx).cloned()
}

/// Convert an enhanced-transaction envelope into a history record. The first
/// instruction owned by the program drives the decode; a transaction with no
/// program instruction (or an undecodable one) still yields a record with
/// `Unknown` so history counts stay truthful.
pub fn decode_transaction(
    program_id: &str,
    tx: &EnhancedTransaction,
    source: RecordSource,
) -> HistoryItem {
    let mut item = HistoryItem {
        signature: tx.signature.clone(),
        slot: tx.slot,
        block_time: tx.block_time(),
        instruction: MarketInstruction::Unknown,
        fee_payer: tx.fee_payer.clone(),
        account_keys: Vec::new(),
        pool: None,
        escrow: None,
        nft_mint: None,
        price_lamports: None,
        price_load_attempted: false,
        price_load_succeeded: false,
        source,
        observed_at: Utc::now(),
    };

    let Some(ix) = first_program_instruction(program_id, tx) else {
        return item;
    };
    item.account_keys = ix.accounts.clone();

    let Some(raw) = decode_payload(&ix.data) else {
        tracing::debug!(signature = %tx.signature, "instruction payload not base58/base64");
        return item;
    };

    item.instruction = decode_instruction(&raw);
    if let Some(schema) = schema_for(&item.instruction) {
        item.pool = resolve_slot(schema, &ix.accounts, "pool");
        item.escrow = resolve_slot(schema, &ix.accounts, "escrow");
        // The collection mint doubles as the asset slot for collection NFTs.
        item.nft_mint = resolve_slot(schema, &ix.accounts, "nft_mint")
            .or_else(|| resolve_slot(schema, &ix.accounts, "collection_mint"));
    }
    item
}

fn first_program_instruction<'a>(
    program_id: &str,
    tx: &'a EnhancedTransaction,
) -> Option<&'a EnhancedInstruction> {
    tx.instructions.iter().find(|ix| ix.program_id == program_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM_ID: &str = "MintStreetProgram1111111111111111111111111";

    fn encode_ix(name: &str, args: &[u8]) -> String {
        let mut data = anchor_discriminator(name).to_vec();
        data.extend_from_slice(args);
        bs58::encode(data).into_string()
    }

    fn metadata_args() -> Vec<u8> {
        borsh::to_vec(&MetadataArgs {
            name: "Street Cat #1".to_string(),
            symbol: "CAT".to_string(),
            uri: "https://arweave.net/cat1".to_string(),
        })
        .unwrap()
    }

    fn mint_tx() -> EnhancedTransaction {
        EnhancedTransaction {
            signature: "mint_sig".to_string(),
            slot: 1_000,
            timestamp: Some(1_700_000_000),
            fee_payer: "payer_wallet".to_string(),
            instructions: vec![EnhancedInstruction {
                program_id: PROGRAM_ID.to_string(),
                accounts: vec![
                    "payer_wallet".to_string(),
                    "pool_addr".to_string(),
                    "escrow_addr".to_string(),
                    "nft_mint_addr".to_string(),
                    "metadata_addr".to_string(),
                    "11111111111111111111111111111111".to_string(),
                ],
                data: encode_ix("mintNft", &metadata_args()),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_discriminators_distinct_and_stable() {
        let schemas = program_schemas();
        for (i, a) in schemas.iter().enumerate() {
            assert_eq!(a.discriminator, anchor_discriminator(a.name));
            for b in &schemas[i + 1..] {
                assert_ne!(a.discriminator, b.discriminator);
            }
        }
    }

    #[test]
    fn test_decode_payload_base58_and_base64() {
        let raw = vec![1u8, 2, 3, 4, 5];
        let b58 = bs58::encode(&raw).into_string();
        assert_eq!(decode_payload(&b58).unwrap(), raw);

        // "!!" is not base58 alphabet; round-trips through base64.
        let b64 = BASE64.encode(b"!! payload");
        assert_eq!(decode_payload(&b64).unwrap(), b"!! payload".to_vec());

        assert!(decode_payload("not valid in either 0OIl~~").is_none());
    }

    #[test]
    fn test_decode_create_pool() {
        let args = borsh::to_vec(&CreatePoolArgs {
            base_price_lamports: 100_000_000,
            growth_factor_bps: 150,
        })
        .unwrap();
        let mut data = anchor_discriminator("createPool").to_vec();
        data.extend_from_slice(&args);

        match decode_instruction(&data) {
            MarketInstruction::CreatePool {
                base_price_lamports,
                growth_factor_bps,
            } => {
                assert_eq!(base_price_lamports, 100_000_000);
                assert_eq!(growth_factor_bps, 150);
            }
            other => panic!("expected createPool, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_mint_nft_metadata() {
        let mut data = anchor_discriminator("mintNft").to_vec();
        data.extend_from_slice(&metadata_args());

        match decode_instruction(&data) {
            MarketInstruction::MintNft { name, symbol, uri } => {
                assert_eq!(name, "Street Cat #1");
                assert_eq!(symbol, "CAT");
                assert_eq!(uri, "https://arweave.net/cat1");
            }
            other => panic!("expected mintNft, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_sell_nft_no_args() {
        let data = anchor_discriminator("sellNft").to_vec();
        assert_eq!(decode_instruction(&data), MarketInstruction::SellNft);

        // Trailing bytes on a no-arg instruction are a layout mismatch.
        let mut with_extra = data.clone();
        with_extra.push(7);
        assert_eq!(decode_instruction(&with_extra), MarketInstruction::Unknown);
    }

    #[test]
    fn test_unknown_discriminator_and_short_data() {
        let data = anchor_discriminator("transferOwnership").to_vec();
        assert_eq!(decode_instruction(&data), MarketInstruction::Unknown);
        assert_eq!(decode_instruction(&[1, 2, 3]), MarketInstruction::Unknown);
        assert_eq!(decode_instruction(&[]), MarketInstruction::Unknown);
    }

    #[test]
    fn test_truncated_args_decode_to_unknown() {
        let mut data = anchor_discriminator("createPool").to_vec();
        data.extend_from_slice(&42u64.to_le_bytes());
        // second u64 missing
        assert_eq!(decode_instruction(&data), MarketInstruction::Unknown);
    }

    #[test]
    fn test_resolve_slot() {
        let schemas = program_schemas();
        let sell = &schemas[3];
        let accounts: Vec<String> = ["seller_w", "pool_a", "escrow_a", "mint_a", "ta_a"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(resolve_slot(sell, &accounts, "pool").unwrap(), "pool_a");
        assert_eq!(resolve_slot(sell, &accounts, "escrow").unwrap(), "escrow_a");
        assert!(resolve_slot(sell, &accounts, "metadata").is_none());

        // Account list shorter than the slot index.
        let short: Vec<String> = vec!["seller_w".to_string()];
        assert!(resolve_slot(sell, &short, "pool").is_none());
    }

    #[test]
    fn test_decode_transaction_resolves_slots() {
        let tx = mint_tx();
        let item = decode_transaction(PROGRAM_ID, &tx, RecordSource::Poll);

        assert_eq!(item.signature, "mint_sig");
        assert_eq!(item.slot, 1_000);
        assert_eq!(item.instruction.name(), "mintNft");
        assert_eq!(item.pool.as_deref(), Some("pool_addr"));
        assert_eq!(item.escrow.as_deref(), Some("escrow_addr"));
        assert_eq!(item.nft_mint.as_deref(), Some("nft_mint_addr"));
        assert_eq!(item.fee_payer, "payer_wallet");
        assert_eq!(item.source, RecordSource::Poll);
        assert!(!item.price_load_attempted);
    }

    #[test]
    fn test_decode_transaction_keeps_unknown_records() {
        // Foreign program only: record survives as Unknown with no slots.
        let mut tx = mint_tx();
        tx.instructions[0].program_id = "SomeOtherProgram111111111111111111111111111".to_string();
        let item = decode_transaction(PROGRAM_ID, &tx, RecordSource::Push);
        assert!(item.instruction.is_unknown());
        assert!(item.pool.is_none());
        assert_eq!(item.source, RecordSource::Push);

        // Garbled payload on our program: accounts kept, instruction Unknown.
        let mut tx = mint_tx();
        tx.instructions[0].data = "zzzz".to_string();
        let item = decode_transaction(PROGRAM_ID, &tx, RecordSource::Poll);
        assert!(item.instruction.is_unknown());
        assert_eq!(item.account_keys.len(), 6);
    }

    #[test]
    fn test_collection_mint_fills_asset_slot() {
        let mut tx = mint_tx();
        tx.instructions[0].accounts = vec![
            "payer_wallet".to_string(),
            "pool_addr".to_string(),
            "collection_mint_addr".to_string(),
            "metadata_addr".to_string(),
            "11111111111111111111111111111111".to_string(),
        ];
        tx.instructions[0].data = encode_ix("createCollectionNft", &metadata_args());

        let item = decode_transaction(PROGRAM_ID, &tx, RecordSource::Poll);
        assert_eq!(item.instruction.name(), "createCollectionNft");
        assert_eq!(item.nft_mint.as_deref(), Some("collection_mint_addr"));
        // createCollectionNft has no escrow slot.
        assert!(item.escrow.is_none());
    }
}
