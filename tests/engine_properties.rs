//! Dispatcher behaviour observable on the wire: addressing, bounds, sign
//! handling, coil packing, hook transactions and permissions.

mod common;

use common::*;
use rand::Rng;
use servo_modbus::crc::{checksum, crc16, CRC_SEED};
use servo_modbus::error::HookPhase;
use servo_modbus::runtime::STATUS_MOVING;
use servo_modbus::{BindingEntry, ParamType, ParameterDatabase, ParameterDescriptor};

const ILLEGAL_DATA_VALUE: u8 = 0x03;

fn exception(function: u8, code: u8) -> Option<Vec<u8>> {
    Some(vec![function | 0x80, code])
}

#[test]
fn test_crc_matches_reference_and_composes() {
    let reference = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let len = rng.gen_range(0..=256);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let whole = checksum(&data);
        assert_eq!(whole, reference.checksum(&data));

        let split = rng.gen_range(0..=len);
        let (head, tail) = data.split_at(split);
        assert_eq!(crc16(crc16(CRC_SEED, head), tail), whole, "split at {} of {}", split, len);
    }
}

#[test]
fn test_classic_addressing_is_native_plus_one() {
    init_logging();
    let config = servo_modbus::EngineConfig { zero_base_address: false, ..Default::default() };
    let (mut classic, classic_drive) = engine(&config);
    let (mut native, native_drive) = native_engine();
    for drive in [&classic_drive, &native_drive] {
        drive.database.write_bytes(1, 0, &0x1234u16.to_ne_bytes()).unwrap();
        drive.database.write_bytes(2, 0, &0x89AB_CDEFu32.to_ne_bytes()).unwrap();
        drive.database.write_bytes(5, 0, &480u16.to_ne_bytes()).unwrap();
    }

    let mut addresses: Vec<u16> = vec![0, 1, 99, 100, 18079, 18080, 18099, 18100, 18101, 19998, 65534];
    addresses.extend(18081u16..=18083);
    addresses.extend(19999u16..=20010);
    for x in addresses {
        for count in [1u16, 2] {
            assert_eq!(
                classic.process_pdu(&read_holding(x, count)),
                native.process_pdu(&read_holding(x + 1, count)),
                "wire address {} count {}",
                x,
                count
            );
        }
    }
}

#[test]
fn test_register_count_bounds() {
    let (mut engine, drive) = native_engine();
    let start = ALARM_LIST as u16;
    assert_eq!(engine.process_pdu(&read_holding(start, 0)), exception(0x03, ILLEGAL_DATA_VALUE));
    assert_eq!(engine.process_pdu(&read_holding(start, 121)), exception(0x03, ILLEGAL_DATA_VALUE));

    for count in 1..=120u16 {
        let reply = engine.process_pdu(&read_holding(start, count)).unwrap();
        assert_eq!(reply[0], 0x03, "count {}", count);
        assert_eq!(usize::from(reply[1]), usize::from(count) * 2);
        let last = &reply[reply.len() - 2..];
        assert_eq!(last, &(count - 1).to_be_bytes());
    }
    assert_eq!(drive.hook.phases().len(), 3 * 120);
}

#[test]
fn test_hook_read_starts_at_request_offset() {
    let (mut engine, _drive) = native_engine();
    let reply = engine.process_pdu(&read_holding(ALARM_LIST as u16 + 10, 2)).unwrap();
    assert_eq!(reply, vec![0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B]);
}

#[test]
fn test_signed_write_read_round_trip() {
    let (mut engine, _drive) = native_engine();
    let speed = SPEED as u16;

    assert_eq!(engine.process_pdu(&write_single(speed, 0xFFFF)), Some(write_single(speed, 0xFFFF)));
    assert_eq!(engine.process_pdu(&read_holding(speed, 1)), Some(vec![0x03, 0x02, 0xFF, 0xFF]));
    assert_eq!(
        engine.process_pdu(&read_holding(speed, 2)),
        Some(vec![0x03, 0x04, 0xFF, 0xFF, 0xFF, 0xFF])
    );

    engine.process_pdu(&write_single(speed, 0x7FFF)).unwrap();
    assert_eq!(
        engine.process_pdu(&read_holding(speed, 2)),
        Some(vec![0x03, 0x04, 0x00, 0x00, 0x7F, 0xFF])
    );
}

#[test]
fn test_double_word_write_multiple_round_trip() {
    let (mut engine, drive) = native_engine();
    let position = POSITION as u16;
    let mut pdu = vec![0x10];
    pdu.extend_from_slice(&position.to_be_bytes());
    pdu.extend_from_slice(&[0x00, 0x02, 0x04, 0xFF, 0xFF, 0xFF, 0xFE]);

    let mut echo = vec![0x10];
    echo.extend_from_slice(&position.to_be_bytes());
    echo.extend_from_slice(&[0x00, 0x02]);
    assert_eq!(engine.process_pdu(&pdu), Some(echo));

    let mut stored = [0u8; 4];
    drive.database.read_bytes(2, 0, &mut stored).unwrap();
    assert_eq!(i32::from_ne_bytes(stored), -2);
    assert_eq!(
        engine.process_pdu(&read_holding(position, 2)),
        Some(vec![0x03, 0x04, 0xFF, 0xFF, 0xFF, 0xFE])
    );
}

#[test]
fn test_input_registers_share_holding_table() {
    let (mut engine, drive) = native_engine();
    drive.database.write_bytes(5, 0, &480u16.to_ne_bytes()).unwrap();
    let mut pdu = read_holding(BUS_VOLTAGE as u16, 1);
    pdu[0] = 0x04;
    assert_eq!(engine.process_pdu(&pdu), Some(vec![0x04, 0x02, 0x01, 0xE0]));
}

fn coil_byte(engine: &mut servo_modbus::ModbusEngine, first: u16) -> u8 {
    let reply = engine.process_pdu(&read_coils(first, 8)).unwrap();
    assert_eq!(&reply[..2], &[0x01, 0x01]);
    reply[2]
}

#[test]
fn test_single_coil_write_touches_one_bit() {
    let (mut engine, drive) = native_engine();
    drive.database.write_bytes(10, 0, &[0xA5, 0x5A, 0xC3, 0x3C]).unwrap();

    for k in [3u16, 8, 13, 20, 27] {
        let before = coil_byte(&mut engine, k - 3);
        let was_set = before & (1 << 3) != 0;

        assert_eq!(engine.process_pdu(&write_coil(k, !was_set)), Some(write_coil(k, !was_set)));
        let after = coil_byte(&mut engine, k - 3);
        assert_eq!(after, before ^ (1 << 3), "coil {}", k);

        let mut storage = [0u8; 4];
        drive.database.read_bytes(10, 0, &mut storage).unwrap();
        assert_eq!(storage[usize::from(k / 8)] & (1 << (k % 8)) != 0, !was_set);

        engine.process_pdu(&write_coil(k, was_set)).unwrap();
        assert_eq!(coil_byte(&mut engine, k - 3), before);
    }
}

#[test]
fn test_coil_block_round_trip() {
    let (mut engine, drive) = native_engine();
    let pattern = [0x5A, 0xC3];
    assert_eq!(engine.process_pdu(&write_coils(0, 16, &pattern)), Some(vec![0x0F, 0x00, 0x00, 0x00, 0x10]));
    assert_eq!(engine.process_pdu(&read_coils(0, 16)), Some(vec![0x01, 0x02, 0x5A, 0xC3]));

    let mut storage = [0u8; 4];
    drive.database.read_bytes(10, 0, &mut storage).unwrap();
    assert_eq!(storage, [0x5A, 0xC3, 0x00, 0x00]);
}

#[test]
fn test_partial_coil_byte_leaves_neighbours() {
    let (mut engine, drive) = native_engine();
    drive.database.write_bytes(10, 0, &[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
    engine.process_pdu(&write_coils(5, 6, &[0b0000_0000])).unwrap();

    let mut storage = [0u8; 4];
    drive.database.read_bytes(10, 0, &mut storage).unwrap();
    assert_eq!(storage, [0b0001_1111, 0b1111_1000, 0xFF, 0xFF]);
    assert_eq!(engine.process_pdu(&read_coils(4, 3)), Some(vec![0x01, 0x01, 0b0000_0001]));
}

#[test]
fn test_coil_bounds_and_permissions() {
    let (mut engine, _drive) = native_engine();
    // outputs cover coils 0-31
    assert_eq!(engine.process_pdu(&read_coils(30, 4)), exception(0x01, ILLEGAL_DATA_VALUE));
    assert_eq!(engine.process_pdu(&read_coils(40, 1)), exception(0x01, ILLEGAL_DATA_VALUE));
    assert_eq!(engine.process_pdu(&read_coils(INPUTS as u16, 8)), Some(vec![0x01, 0x01, 0x00]));

    let mut discrete = read_coils(INPUTS as u16, 8);
    discrete[0] = 0x02;
    assert_eq!(engine.process_pdu(&discrete), Some(vec![0x02, 0x01, 0x00]));

    assert_eq!(
        engine.process_pdu(&write_coil(INPUTS as u16, true)),
        exception(0x05, ILLEGAL_DATA_VALUE)
    );
    assert_eq!(
        engine.process_pdu(&[0x05, 0x00, 0x00, 0x12, 0x34]),
        exception(0x05, ILLEGAL_DATA_VALUE)
    );
}

#[test]
fn test_hook_phases_run_once_in_order() {
    let (mut engine, drive) = native_engine();
    engine.process_pdu(&read_holding(ALARM_LIST as u16, 4)).unwrap();
    assert_eq!(drive.hook.phases(), vec![HookPhase::Init, HookPhase::Segment, HookPhase::End]);
}

#[test]
fn test_hook_failure_stops_transaction() {
    let (mut engine, drive) = native_engine();
    let cases = [
        (HookPhase::Init, vec![HookPhase::Init]),
        (HookPhase::Segment, vec![HookPhase::Init, HookPhase::Segment]),
        (HookPhase::End, vec![HookPhase::Init, HookPhase::Segment, HookPhase::End]),
    ];
    for (failing, expected) in cases {
        drive.hook.reset();
        drive.hook.fail_at(Some(failing));
        assert_eq!(
            engine.process_pdu(&read_holding(ALARM_LIST as u16, 4)),
            exception(0x03, ILLEGAL_DATA_VALUE)
        );
        assert_eq!(drive.hook.phases(), expected, "failure in {}", failing);
    }
}

#[test]
fn test_unknown_functions_are_illegal_function() {
    let (mut engine, _drive) = native_engine();
    let known = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0D, 0x0F, 0x10];
    for code in (0u8..0x80).filter(|c| !known.contains(c)) {
        assert_eq!(engine.process_pdu(&[code, 0x00, 0x00]), Some(vec![code | 0x80, 0x01]));
    }
}

#[test]
fn test_malformed_requests_are_illegal_data_value() {
    let (mut engine, _drive) = native_engine();
    // truncated read
    assert_eq!(engine.process_pdu(&[0x03, 0x46, 0xA2]), exception(0x03, ILLEGAL_DATA_VALUE));
    // byte count does not match register count
    assert_eq!(
        engine.process_pdu(&[0x10, 0x46, 0xA2, 0x00, 0x01, 0x04, 0x00, 0x01, 0x00, 0x02]),
        exception(0x10, ILLEGAL_DATA_VALUE)
    );
    // byte count does not match coil count
    assert_eq!(
        engine.process_pdu(&[0x0F, 0x00, 0x00, 0x00, 0x09, 0x01, 0xFF]),
        exception(0x0F, ILLEGAL_DATA_VALUE)
    );
    // three registers from a plain parameter
    assert_eq!(engine.process_pdu(&read_holding(SPEED as u16, 3)), exception(0x03, ILLEGAL_DATA_VALUE));
}

#[test]
fn test_write_permissions() {
    let (mut engine, drive) = native_engine();
    assert_eq!(
        engine.process_pdu(&write_single(BUS_VOLTAGE as u16, 1)),
        exception(0x06, ILLEGAL_DATA_VALUE)
    );

    drive.runtime.set_status(STATUS_MOVING);
    assert_eq!(
        engine.process_pdu(&write_single(TORQUE_LIMIT as u16, 50)),
        exception(0x06, ILLEGAL_DATA_VALUE)
    );
    drive.runtime.set_status(0);
    assert_eq!(
        engine.process_pdu(&write_single(TORQUE_LIMIT as u16, 50)),
        Some(write_single(TORQUE_LIMIT as u16, 50))
    );
}

#[test]
fn test_validated_write_rejected_outside_limits() {
    let (mut engine, drive) = native_engine();
    let address = CURRENT_LIMIT as u16;
    assert_eq!(engine.process_pdu(&write_single(address, 1000)), Some(write_single(address, 1000)));
    assert_eq!(engine.process_pdu(&write_single(address, 1001)), exception(0x06, ILLEGAL_DATA_VALUE));

    let mut stored = [0u8; 2];
    drive.database.read_bytes(3, 0, &mut stored).unwrap();
    assert_eq!(u16::from_ne_bytes(stored), 1000);
}

#[test]
fn test_overrides_take_precedence_until_cleared() {
    let (mut engine, drive) = native_engine();
    drive.database.write_bytes(1, 0, &7u16.to_ne_bytes()).unwrap();

    let live = ParameterDescriptor::new(40, "live_data", ParamType::Stream, 8).with_hook(drive.hook.clone());
    engine.register_override(BindingEntry::new(SPEED, live.clone())).unwrap();
    engine.register_override(BindingEntry::new(30000, live)).unwrap();

    assert_eq!(engine.process_pdu(&read_holding(SPEED as u16 + 2, 1)), Some(vec![0x03, 0x02, 0x00, 0x02]));
    assert_eq!(engine.process_pdu(&read_holding(30003, 1)), Some(vec![0x03, 0x02, 0x00, 0x03]));

    engine.clear_overrides();
    assert_eq!(engine.process_pdu(&read_holding(SPEED as u16, 1)), Some(vec![0x03, 0x02, 0x00, 0x07]));
    assert_eq!(engine.process_pdu(&read_holding(30000, 1)), exception(0x03, ILLEGAL_DATA_VALUE));
}

#[test]
fn test_coil_override_rejects_hooks() {
    let (mut engine, drive) = native_engine();
    let hooked = ParameterDescriptor::new(41, "hooked", ParamType::Stream, 1).with_hook(drive.hook.clone());
    assert!(engine.coil_override(BindingEntry::new(500, hooked)).is_err());

    let shadow = ParameterDescriptor::new(10, "outputs_shadow", ParamType::BitByte, 1).writable();
    engine.coil_override(BindingEntry::new(500, shadow)).unwrap();
    engine.process_pdu(&write_coil(501, true)).unwrap();
    assert_eq!(engine.process_pdu(&read_coils(1, 1)), Some(vec![0x01, 0x01, 0x01]));
}

#[test]
fn test_stats_count_requests_and_exceptions() {
    let (mut engine, _drive) = native_engine();
    engine.process_pdu(&read_holding(SPEED as u16, 1));
    engine.process_pdu(&[0x2B]);
    let stats = engine.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.exceptions, 1);
}
