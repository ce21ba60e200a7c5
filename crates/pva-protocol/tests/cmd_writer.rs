use pretty_assertions::assert_eq;
use pva_protocol::cmd::{Cmd, InitQueue, InitResourceTable, InitSharedDramBuffer};
use pva_protocol::{CmdStream, PvaCmdWriter, RawCmds, ResourceEntry, PRIV_QUEUE_ID};

#[test]
fn writer_emits_decodable_context_init_batch() {
    let mut w = PvaCmdWriter::new();
    w.init_resource_table(2, 0x40_0000, 65)
        .update_resource_table(2, 1, ResourceEntry::INVALID)
        .init_queue(2, PRIV_QUEUE_ID, 0x41_0000, 16, 5)
        .init_shared_dram_buffer(0, 0x42_0000, 528);
    assert_eq!(w.len(), 4);

    let bytes = w.finish();
    assert_eq!(bytes.len(), 16 + 28 + 20 + 16);

    let cmds: Vec<Cmd> = CmdStream::new(&bytes).collect::<Result<_, _>>().unwrap();
    assert_eq!(
        cmds[0],
        Cmd::InitResourceTable(InitResourceTable {
            resource_table_id: 2,
            iova: 0x40_0000,
            max_n_entries: 65,
        })
    );
    assert_eq!(
        cmds[2],
        Cmd::InitQueue(InitQueue {
            ccq_id: 2,
            queue_id: PRIV_QUEUE_ID,
            iova: 0x41_0000,
            max_n_submits: 16,
            syncpoint_id: 5,
        })
    );
    assert_eq!(
        cmds[3],
        Cmd::InitSharedDramBuffer(InitSharedDramBuffer {
            interface: 0,
            iova: 0x42_0000,
            size: 528,
        })
    );
}

#[test]
fn raw_split_matches_command_boundaries() {
    let mut w = PvaCmdWriter::new();
    w.suspend_fw().set_trace_level(4).resume_fw().deinit_queue(1, 0);
    let bytes = w.finish();

    let sizes: Vec<usize> = RawCmds::new(&bytes).map(|c| c.unwrap().len()).collect();
    assert_eq!(sizes, vec![4, 8, 4, 8]);
}

#[test]
fn empty_writer_produces_empty_stream() {
    let w = PvaCmdWriter::new();
    assert!(w.is_empty());
    assert_eq!(CmdStream::new(w.as_bytes()).count(), 0);
}
