// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print representor offload state in a human-friendly manner.

use crate::engine::rep::TcRep;
use std::io::Write;
use tabwriter::TabWriter;

/// Print the neighbor table of `rep` and the encap entries hanging off
/// each neighbor.
pub fn print_neigh_table(rep: &TcRep) -> std::io::Result<()> {
    print_neigh_table_into(&mut std::io::stdout(), rep)
}

/// Print the neighbor table of `rep` into a given writer.
pub fn print_neigh_table_into(
    writer: &mut impl Write,
    rep: &TcRep,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Neighbors {}", rep.name())?;
    write_hrb(&mut t)?;
    writeln!(t, "NEIGH\tDEV\tREFCNT\tENCAPS")?;
    write_hr(&mut t)?;

    let entries = rep.neigh().dump();
    for nhe in &entries {
        writeln!(
            t,
            "{}\t{}\t{}\t{}",
            nhe.key,
            nhe.neigh_dev().name,
            nhe.refcnt(),
            nhe.encaps().len(),
        )?;
    }
    t.flush()?;

    writeln!(t, "\nEncap Entries")?;
    write_hr(&mut t)?;
    writeln!(t, "NEIGH\tREFORMAT\tROUTE DEV\tVALID\tDST MAC\tFLOWS")?;
    for nhe in &entries {
        for e in nhe.encaps().iter() {
            writeln!(
                t,
                "{}\t{:?}\t{}\t{}\t{}\t{}",
                nhe.key,
                e.reformat_type,
                e.route_dev_ifindex,
                e.is_valid(),
                e.h_dest(),
                e.num_flows(),
            )?;
        }
    }

    writeln!(t)?;
    t.flush()
}

/// Print the indirect bindings of `rep`.
pub fn print_indr_bindings(rep: &TcRep) -> std::io::Result<()> {
    print_indr_bindings_into(&mut std::io::stdout(), rep)
}

/// Print the indirect bindings of `rep` into a given writer.
pub fn print_indr_bindings_into(
    writer: &mut impl Write,
    rep: &TcRep,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "IFINDEX\tNAME\tKIND\tHOOK")?;

    for indr in rep.indr_bindings().iter() {
        writeln!(
            t,
            "{}\t{}\t{}\t{}",
            indr.ifindex,
            indr.name,
            indr.kind,
            indr.binder_type,
        )?;
    }
    t.flush()
}

/// Print the standalone action handlers registered on `rep`.
pub fn print_acts_into(
    writer: &mut impl Write,
    rep: &TcRep,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "ACTION\tNAMESPACE\tCAPS")?;

    for (id, ns, caps) in rep.acts().dump() {
        writeln!(t, "{id}\t{ns}\t{caps:?}")?;
    }
    t.flush()
}

/// Output a horizontal rule in bold to the given writer.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Output a horizontal rule to the given writer.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::EswTcCfg;
    use crate::engine::block::FlowBlock;
    use crate::engine::block::FlowBlockOffload;
    use crate::engine::block::TcSetup;
    use crate::engine::dispatch::test::new_rep;
    use crate::engine::netdev::NetDev;
    use crate::engine::netdev::NetDevKind;
    use crate::engine::netdev::TunnelKind;
    use alloc::string::String;
    use alloc::vec::Vec;
    use esw_tc_api::BlockBinderType;
    use esw_tc_api::BlockCommand;
    use esw_tc_api::MacAddr;

    #[test]
    fn indr_bindings_table() {
        let (rep, _) = new_rep(EswTcCfg::default());
        let vxlan = rep.devs().register(NetDev::new(
            7,
            "vxlan0",
            NetDevKind::Tunnel(TunnelKind::Vxlan),
            MacAddr::ZERO,
        ));

        let block = FlowBlock::new();
        let mut bo = FlowBlockOffload::new(
            BlockCommand::Bind,
            BlockBinderType::ClsactIngress,
            &block,
        );
        rep.indr_setup_cb(Some(&vxlan), TcSetup::Block(&mut bo)).unwrap();

        let mut out = Vec::new();
        print_indr_bindings_into(&mut out, &rep).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("vxlan0"));
        assert!(out.contains("ingress"));

        let mut out = Vec::new();
        print_neigh_table_into(&mut out, &rep).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("NEIGH"));
    }
}
