// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Custodied-token (ERC-20) contract interface.

use alloy::sol;

// The slice of the ERC-20 interface the pipeline actually uses: balance
// reads for sync/sweep decisions and transfers for sweeps and withdrawals.
sol! {
    #[sol(rpc)]
    interface IERC20 {
        function decimals() external view returns (uint8);
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}
